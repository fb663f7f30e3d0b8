//! In-memory sandbox fakes for unit tests

use crate::error::{EngineError, Result};
use crate::sandbox::{ExecOutput, ExecRequest, Sandbox, SandboxProvider, SandboxSpec};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Decides what a guest or system command "prints", or how its exec fails
pub type Handler = dyn Fn(&[String], &HashMap<String, String>) -> Result<ExecOutput> + Send + Sync;

#[derive(Clone)]
pub struct FakeScript {
    handler: Arc<Handler>,
}

impl FakeScript {
    /// Every command succeeds silently
    pub fn ok() -> Self {
        Self::new(|_, _| ok(""))
    }

    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[String], &HashMap<String, String>) -> ExecOutput + Send + Sync + 'static,
    {
        Self::fallible(move |cmd, files| Ok(handler(cmd, files)))
    }

    /// Script that may fail the exec itself
    pub fn fallible<F>(handler: F) -> Self
    where
        F: Fn(&[String], &HashMap<String, String>) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        exit_code: Some(0),
        ..Default::default()
    }
}

pub fn failed(code: i64, stderr: &str) -> ExecOutput {
    ExecOutput {
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..Default::default()
    }
}

pub struct FakeSandbox {
    id: String,
    script: FakeScript,
    files: Mutex<HashMap<String, Vec<u8>>>,
    log: Mutex<Vec<Vec<String>>>,
    alive: AtomicBool,
}

impl FakeSandbox {
    pub fn new(id: &str, script: FakeScript) -> Self {
        Self {
            id: id.to_string(),
            script,
            files: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        let files = self.files.lock().unwrap();
        files.get(path).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Commands executed so far, with the guest `timeout` wrapper stripped
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    fn text_files(&self) -> HashMap<String, String> {
        let files = self.files.lock().unwrap();
        files
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }

    fn builtin(&self, cmd: &[String]) -> Option<ExecOutput> {
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["sh", "-c", script, "_", path] if script.starts_with(": >") => {
                self.files.lock().unwrap().insert(path.to_string(), Vec::new());
                Some(ok(""))
            }
            ["sh", "-c", script, "_", chunk, path] if script.contains("base64 -d") => {
                let decoded = general_purpose::STANDARD.decode(chunk).unwrap();
                self.files
                    .lock()
                    .unwrap()
                    .entry(path.to_string())
                    .or_default()
                    .extend(decoded);
                Some(ok(""))
            }
            ["mkdir", "-p", ..] => Some(ok("")),
            ["rm", "-rf", targets @ ..] => {
                let mut files = self.files.lock().unwrap();
                for target in targets {
                    let prefix = format!("{}/", target.trim_end_matches('/'));
                    files.retain(|p, _| p != target && !p.starts_with(&prefix));
                }
                Some(ok(""))
            }
            _ => None,
        }
    }
}

/// Strip `timeout -s KILL <secs>` from a guest command
pub fn unwrap_guest(cmd: &[String]) -> &[String] {
    if cmd.len() >= 4 && cmd[0] == "timeout" && cmd[1] == "-s" && cmd[2] == "KILL" {
        &cmd[4..]
    } else {
        cmd
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        if !self.is_alive() {
            return Err(EngineError::Sandbox(format!("container {} is not running", self.id)));
        }
        let cmd = unwrap_guest(&request.cmd).to_vec();
        self.log.lock().unwrap().push(cmd.clone());
        if let Some(output) = self.builtin(&cmd) {
            return Ok(output);
        }
        let mut output = (self.script.handler)(&cmd, &self.text_files())?;
        if output.timed_out {
            // Scripts report a timeout; mirror what the kill wrapper produces
            output.exit_code = Some(137);
            output.elapsed = request.limit.unwrap_or(Duration::from_secs(1));
        }
        Ok(output)
    }
}

/// Provider handing out `FakeSandbox`es named after the requested container
pub struct FakeProvider {
    script: FakeScript,
    sandboxes: Mutex<HashMap<String, Arc<FakeSandbox>>>,
    created: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    fail_creates: AtomicBool,
    fail_destroys: AtomicBool,
}

impl FakeProvider {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            sandboxes: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
            fail_creates: AtomicBool::new(false),
            fail_destroys: AtomicBool::new(false),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Removal reports a daemon error after the container is gone
    pub fn fail_destroys(&self, fail: bool) {
        self.fail_destroys.store(fail, Ordering::SeqCst);
    }

    pub fn sandbox(&self, id: &str) -> Option<Arc<FakeSandbox>> {
        self.sandboxes.lock().unwrap().get(id).cloned()
    }

    /// Simulate the container being killed from outside
    pub fn kill(&self, id: &str) {
        if let Some(sandbox) = self.sandbox(id) {
            sandbox.kill();
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(EngineError::Sandbox("docker daemon unavailable".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let sandbox = Arc::new(FakeSandbox::new(&spec.name, self.script.clone()));
        self.sandboxes
            .lock()
            .unwrap()
            .insert(spec.name.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn is_running(&self, id: &str) -> bool {
        self.sandbox(id).map_or(false, |s| s.is_alive())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        if let Some(sandbox) = self.sandboxes.lock().unwrap().remove(id) {
            sandbox.kill();
        }
        self.destroyed.lock().unwrap().push(id.to_string());
        if self.fail_destroys.load(Ordering::SeqCst) {
            return Err(EngineError::Sandbox(format!("removal of {} failed", id)));
        }
        Ok(())
    }

    async fn remove_managed(&self, prefix: &str) -> Result<usize> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let before = sandboxes.len();
        sandboxes.retain(|name, _| !name.starts_with(prefix));
        Ok(before - sandboxes.len())
    }
}
