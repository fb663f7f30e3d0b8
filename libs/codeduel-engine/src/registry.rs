/// Signature Registry - Read-Only Problem Definitions
///
/// **Core Responsibility:**
/// Serve problem definitions (function name, typed signature, test cases) keyed by
/// problem id, and answer "which harness shape does this problem/language pair use".
///
/// **Properties:**
/// - Read-only: the data layer owns problem files, the engine never writes them
/// - Closed type set: every parameter and return type is one of `ParamType`
/// - Never guesses: a missing signature or language is a `Configuration` error
use crate::error::{EngineError, Result};
use codeduel_common::types::{Language, TestCase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Parameter and return types a signature may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamType {
    Int,
    Long,
    Double,
    Bool,
    Str,
    CharArray,
    IntArray,
    LongArray,
    DoubleArray,
    BoolArray,
    StrArray,
    IntMatrix,
    StrMatrix,
    CharMatrix,
    IntList,
    StrList,
    IntListList,
    StrListList,
    ListNode,
    TreeNode,
    ListNodeArray,
    Void,
}

impl ParamType {
    /// Element type for sequence types, None for scalars and nodes
    pub fn element(&self) -> Option<ParamType> {
        match self {
            ParamType::CharArray => Some(ParamType::Str),
            ParamType::IntArray | ParamType::IntList => Some(ParamType::Int),
            ParamType::LongArray => Some(ParamType::Long),
            ParamType::DoubleArray => Some(ParamType::Double),
            ParamType::BoolArray => Some(ParamType::Bool),
            ParamType::StrArray | ParamType::StrList => Some(ParamType::Str),
            ParamType::IntMatrix => Some(ParamType::IntArray),
            ParamType::StrMatrix => Some(ParamType::StrArray),
            ParamType::CharMatrix => Some(ParamType::CharArray),
            ParamType::IntListList => Some(ParamType::IntList),
            ParamType::StrListList => Some(ParamType::StrList),
            ParamType::ListNodeArray => Some(ParamType::ListNode),
            _ => None,
        }
    }

    pub fn uses_list_node(&self) -> bool {
        matches!(self, ParamType::ListNode | ParamType::ListNodeArray)
    }

    pub fn uses_tree_node(&self) -> bool {
        matches!(self, ParamType::TreeNode)
    }
}

impl FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let ty = match compact.as_str() {
            "int" | "integer" => ParamType::Int,
            "long" => ParamType::Long,
            "double" | "float" => ParamType::Double,
            "boolean" | "bool" => ParamType::Bool,
            "string" | "str" => ParamType::Str,
            "char[]" => ParamType::CharArray,
            "int[]" => ParamType::IntArray,
            "long[]" => ParamType::LongArray,
            "double[]" => ParamType::DoubleArray,
            "boolean[]" | "bool[]" => ParamType::BoolArray,
            "string[]" => ParamType::StrArray,
            "int[][]" => ParamType::IntMatrix,
            "string[][]" => ParamType::StrMatrix,
            "char[][]" => ParamType::CharMatrix,
            "list<int>" | "list<integer>" => ParamType::IntList,
            "list<string>" => ParamType::StrList,
            "list<list<int>>" | "list<list<integer>>" => ParamType::IntListList,
            "list<list<string>>" => ParamType::StrListList,
            "listnode" => ParamType::ListNode,
            "treenode" => ParamType::TreeNode,
            "listnode[]" => ParamType::ListNodeArray,
            "void" => ParamType::Void,
            _ => return Err(format!("unknown signature type '{}'", s)),
        };
        Ok(ty)
    }
}

impl TryFrom<String> for ParamType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Int => "int",
            ParamType::Long => "long",
            ParamType::Double => "double",
            ParamType::Bool => "boolean",
            ParamType::Str => "string",
            ParamType::CharArray => "char[]",
            ParamType::IntArray => "int[]",
            ParamType::LongArray => "long[]",
            ParamType::DoubleArray => "double[]",
            ParamType::BoolArray => "boolean[]",
            ParamType::StrArray => "string[]",
            ParamType::IntMatrix => "int[][]",
            ParamType::StrMatrix => "string[][]",
            ParamType::CharMatrix => "char[][]",
            ParamType::IntList => "list<int>",
            ParamType::StrList => "list<string>",
            ParamType::IntListList => "list<list<int>>",
            ParamType::StrListList => "list<list<string>>",
            ParamType::ListNode => "ListNode",
            ParamType::TreeNode => "TreeNode",
            ParamType::ListNodeArray => "ListNode[]",
            ParamType::Void => "void",
        };
        write!(f, "{}", name)
    }
}

impl From<ParamType> for String {
    fn from(ty: ParamType) -> Self {
        ty.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
}

/// Ordered parameters plus return type. Order matches the guest function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    pub returns: ParamType,
    /// For `void` functions: the parameter whose final value is the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_param: Option<String>,
}

impl Signature {
    /// Check internal consistency; harness generation relies on these holding
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for param in &self.params {
            if !is_identifier(&param.name) {
                return Err(format!("parameter name '{}' is not an identifier", param.name));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(format!("duplicate parameter '{}'", param.name));
            }
            if param.ty == ParamType::Void {
                return Err(format!("parameter '{}' cannot be void", param.name));
            }
        }
        match (&self.returns, &self.output_param) {
            (ParamType::Void, None) => Err("void return requires output_param".to_string()),
            (ParamType::Void, Some(name)) if !self.params.iter().any(|p| &p.name == name) => {
                Err(format!("output_param '{}' is not a parameter", name))
            }
            (ParamType::Void, Some(_)) => Ok(()),
            (_, Some(_)) => Err("output_param is only valid with a void return".to_string()),
            (_, None) => Ok(()),
        }
    }

    /// Type encoded as the output: the return type, or the output parameter's type
    pub fn output_type(&self) -> ParamType {
        match (&self.returns, &self.output_param) {
            (ParamType::Void, Some(name)) => self
                .params
                .iter()
                .find(|p| &p.name == name)
                .map(|p| p.ty)
                .unwrap_or(ParamType::Void),
            (ty, _) => *ty,
        }
    }

    /// Every type the harness must decode or encode
    pub fn all_types(&self) -> impl Iterator<Item = ParamType> + '_ {
        self.params
            .iter()
            .map(|p| p.ty)
            .chain(std::iter::once(self.output_type()))
    }

    pub fn needs_list_node(&self) -> bool {
        self.all_types().any(|t| t.uses_list_node())
    }

    pub fn needs_tree_node(&self) -> bool {
        self.all_types().any(|t| t.uses_tree_node())
    }
}

/// One problem as stored by the data layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub function_name: String,
    #[serde(default)]
    pub signature: Option<Signature>,
    /// Languages with a harness; absent means all four
    #[serde(default)]
    pub languages: Option<Vec<Language>>,
    /// Compare sequences as multisets
    #[serde(default)]
    pub unordered_output: bool,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl Problem {
    /// Signature to drive the harness for `language`
    ///
    /// Fails with `Configuration` when the problem has no signature or does not
    /// list the language.
    pub fn harness_signature(&self, language: Language) -> Result<&Signature> {
        if let Some(languages) = &self.languages {
            if !languages.contains(&language) {
                return Err(EngineError::Configuration(format!(
                    "no {} harness registered for problem '{}'",
                    language, self.id
                )));
            }
        }
        self.signature.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!("no signature registered for problem '{}'", self.id))
        })
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.function_name) {
            return Err(EngineError::Configuration(format!(
                "problem '{}' has invalid function name '{}'",
                self.id, self.function_name
            )));
        }
        if let Some(signature) = &self.signature {
            signature.validate().map_err(|e| {
                EngineError::Configuration(format!("problem '{}': {}", self.id, e))
            })?;
        }
        Ok(())
    }
}

/// Source of problem definitions
pub trait ProblemStore: Send + Sync {
    /// Load a problem by id; `NotFound` when it does not exist
    fn load(&self, problem_id: &str) -> Result<Arc<Problem>>;
}

fn is_problem_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Identifier valid in all four guest languages
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Problems stored as `<dir>/<problem-id>.json`, cached after first read
pub struct FsProblemStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<Problem>>>,
}

impl FsProblemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self, problem_id: &str) -> Result<Problem> {
        let path = self.root.join(format!("{}.json", problem_id));
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(format!(
                    "no test cases for problem '{}'",
                    problem_id
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut problem: Problem = serde_json::from_str(&content).map_err(|e| {
            EngineError::Configuration(format!("invalid problem file {}: {}", path.display(), e))
        })?;
        if problem.id.is_empty() {
            problem.id = problem_id.to_string();
        }
        Ok(problem)
    }
}

impl ProblemStore for FsProblemStore {
    fn load(&self, problem_id: &str) -> Result<Arc<Problem>> {
        if !is_problem_id(problem_id) {
            return Err(EngineError::NotFound(format!("invalid problem id '{}'", problem_id)));
        }

        if let Ok(cache) = self.cache.read() {
            if let Some(problem) = cache.get(problem_id) {
                return Ok(problem.clone());
            }
        }

        let problem = self.read(problem_id)?;
        problem.validate()?;
        let problem = Arc::new(problem);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(problem_id.to_string(), problem.clone());
        }
        tracing::debug!(problem_id = %problem_id, tests = problem.tests.len(), "Loaded problem");
        Ok(problem)
    }
}

/// Problems held in memory; used by the CLI for ad-hoc files and by tests
#[derive(Default)]
pub struct InMemoryProblemStore {
    problems: HashMap<String, Arc<Problem>>,
}

impl InMemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, problem: Problem) -> Result<()> {
        problem.validate()?;
        self.problems.insert(problem.id.clone(), Arc::new(problem));
        Ok(())
    }
}

impl ProblemStore for InMemoryProblemStore {
    fn load(&self, problem_id: &str) -> Result<Arc<Problem>> {
        self.problems
            .get(problem_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no test cases for problem '{}'", problem_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_sum_json() -> serde_json::Value {
        json!({
            "id": "two-sum",
            "function_name": "twoSum",
            "signature": {
                "params": [{"name": "nums", "type": "int[]"}, {"name": "target", "type": "int"}],
                "returns": "int[]"
            },
            "tests": [{"input": {"nums": [2, 7, 11, 15], "target": 9}, "expected": [0, 1]}]
        })
    }

    #[test]
    fn test_param_type_parsing() {
        assert_eq!("int[]".parse::<ParamType>().unwrap(), ParamType::IntArray);
        assert_eq!("List<List<Integer>>".parse::<ParamType>().unwrap(), ParamType::IntListList);
        assert_eq!("list< string >".parse::<ParamType>().unwrap(), ParamType::StrList);
        assert_eq!("ListNode".parse::<ParamType>().unwrap(), ParamType::ListNode);
        assert!("map<int,int>".parse::<ParamType>().is_err());
        assert_eq!(ParamType::IntMatrix.to_string(), "int[][]");
    }

    #[test]
    fn test_signature_validation() {
        let sig = Signature {
            params: vec![Param { name: "matrix".into(), ty: ParamType::IntMatrix }],
            returns: ParamType::Void,
            output_param: Some("matrix".into()),
        };
        assert!(sig.validate().is_ok());
        assert_eq!(sig.output_type(), ParamType::IntMatrix);

        let missing = Signature { output_param: None, ..sig.clone() };
        assert!(missing.validate().is_err());

        let dup = Signature {
            params: vec![
                Param { name: "a".into(), ty: ParamType::Int },
                Param { name: "a".into(), ty: ParamType::Int },
            ],
            returns: ParamType::Int,
            output_param: None,
        };
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_node_detection() {
        let sig: Signature = serde_json::from_value(json!({
            "params": [{"name": "lists", "type": "ListNode[]"}],
            "returns": "ListNode"
        }))
        .unwrap();
        assert!(sig.needs_list_node());
        assert!(!sig.needs_tree_node());
    }

    #[test]
    fn test_harness_signature_language_gate() {
        let mut problem: Problem = serde_json::from_value(two_sum_json()).unwrap();
        problem.languages = Some(vec![Language::Python]);
        assert!(problem.harness_signature(Language::Python).is_ok());
        assert!(matches!(
            problem.harness_signature(Language::Cpp),
            Err(EngineError::Configuration(_))
        ));

        problem.signature = None;
        assert!(matches!(
            problem.harness_signature(Language::Python),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_fs_store_load_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("two-sum.json"),
            serde_json::to_string(&two_sum_json()).unwrap(),
        )
        .unwrap();

        let store = FsProblemStore::new(dir.path());
        let problem = store.load("two-sum").unwrap();
        assert_eq!(problem.function_name, "twoSum");
        assert_eq!(problem.tests.len(), 1);

        // Second load comes from the cache
        let again = store.load("two-sum").unwrap();
        assert!(Arc::ptr_eq(&problem, &again));

        assert!(matches!(store.load("missing"), Err(EngineError::NotFound(_))));
        assert!(matches!(store.load("../etc/passwd"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_fs_store_rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = two_sum_json();
        raw["signature"]["returns"] = json!("void");
        std::fs::write(dir.path().join("bad.json"), raw.to_string()).unwrap();

        let store = FsProblemStore::new(dir.path());
        assert!(matches!(store.load("bad"), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_shipped_problems_load() {
        let store = FsProblemStore::new(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data/problems"),
        );
        for id in [
            "two-sum",
            "missing-number",
            "reverse-linked-list",
            "maximum-depth-of-binary-tree",
            "rotate-image",
        ] {
            let problem = store.load(id).unwrap();
            assert_eq!(problem.id, id);
            assert!(!problem.tests.is_empty());
            for language in Language::ALL {
                assert!(problem.harness_signature(language).is_ok(), "{} {}", id, language);
            }
        }

        let rotate = store.load("rotate-image").unwrap();
        let signature = rotate.signature.as_ref().unwrap();
        assert_eq!(signature.returns, ParamType::Void);
        assert_eq!(signature.output_type(), ParamType::IntMatrix);
    }
}
