use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Guest languages a player can submit in.
///
/// The wire form is the long lowercase name; the short codes used by the
/// game client (`py`, `js`, `cpp`) are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py")]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    Java,
    #[serde(alias = "c++")]
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
    ];

    /// Short code used by the game client
    pub fn short_code(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }

    /// Whether source must be compiled to an artifact before it can run
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Java | Language::Cpp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::Java => write!(f, "java"),
            Language::Cpp => write!(f, "cpp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language '{}'", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "py" | "python" | "python3" => Ok(Language::Python),
            "js" | "javascript" | "node" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// A single test case: named inputs plus every output that counts as correct.
///
/// On disk a case carries one `expected` value and optionally more
/// `accepted` alternatives; both are folded into `expected` here, which is
/// never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredTestCase", into = "StoredTestCase")]
pub struct TestCase {
    pub input: Map<String, Value>,
    pub expected: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTestCase {
    input: Map<String, Value>,
    expected: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    accepted: Vec<Value>,
}

impl TestCase {
    /// Build a test case, rejecting an empty answer set
    pub fn new(input: Map<String, Value>, expected: Vec<Value>) -> Result<Self, String> {
        if expected.is_empty() {
            return Err("test case must declare at least one expected output".to_string());
        }
        Ok(Self { input, expected })
    }
}

impl TryFrom<StoredTestCase> for TestCase {
    type Error = String;

    fn try_from(stored: StoredTestCase) -> Result<Self, Self::Error> {
        let mut expected = Vec::with_capacity(1 + stored.accepted.len());
        expected.push(stored.expected);
        expected.extend(stored.accepted);
        TestCase::new(stored.input, expected)
    }
}

impl From<TestCase> for StoredTestCase {
    fn from(case: TestCase) -> Self {
        let mut answers = case.expected.into_iter();
        StoredTestCase {
            input: case.input,
            expected: answers.next().unwrap_or(Value::Null),
            accepted: answers.collect(),
        }
    }
}

/// Which test cases a submission runs against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TestSelection {
    /// Every stored test case of the problem
    All,
    /// The first `count` stored cases ("run" button during a match)
    Sample {
        #[serde(default = "default_sample_count")]
        count: usize,
    },
    /// Caller-supplied cases
    Custom { cases: Vec<TestCase> },
}

fn default_sample_count() -> usize {
    3
}

impl Default for TestSelection {
    fn default() -> Self {
        TestSelection::All
    }
}

/// One player submission
///
/// `language` stays a raw string so an unsupported value reaches the engine
/// and is answered with a structured error instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub function_name: Option<String>,
    pub problem_id: String,
    #[serde(default)]
    pub tests: TestSelection,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Submission {
    pub fn new(language: &str, source_code: &str, problem_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            language: language.to_string(),
            source_code: source_code.to_string(),
            function_name: None,
            problem_id: problem_id.to_string(),
            tests: TestSelection::All,
            timeout_seconds: None,
        }
    }
}

/// Queue envelope pushed by the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionJob {
    pub submission: Submission,
    pub enqueued_at: DateTime<Utc>,
}

impl SubmissionJob {
    pub fn new(submission: Submission) -> Self {
        Self {
            submission,
            enqueued_at: Utc::now(),
        }
    }
}

/// Verdict for one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub input: Map<String, Value>,
    pub expected_output: Vec<Value>,
    pub actual_output: Option<Value>,
    pub passed: bool,
    pub error: Option<String>,
    pub execution_time_ms: Option<f64>,
}

/// Coarse failure category carried next to the error string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    UnsupportedLanguage,
    NotFound,
    InvalidSubmission,
    Compile,
    Runtime,
    Timeout,
    Infrastructure,
}

/// Result of executing one submission. This is the only shape that leaves the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub submission_id: Uuid,
    pub success: bool,
    pub test_results: Vec<TestCaseResult>,
    pub total_passed: usize,
    pub total_failed: usize,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl RunResponse {
    /// Response for a submission that never produced per-test verdicts
    pub fn failure(submission_id: Uuid, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            submission_id,
            success: false,
            test_results: Vec::new(),
            total_passed: 0,
            total_failed: 0,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}
