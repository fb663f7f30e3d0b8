/// Result Parser & Comparator
///
/// **Core Responsibility:**
/// Turn guest stdout into per-case verdicts.
///
/// **Parsing:**
/// Only lines that are JSON objects with a boolean `success` are results; anything
/// else the user printed is diagnostic noise. Short output is padded with synthetic
/// failures so `results[i]` always lines up with `cases[i]`.
///
/// **Comparison:**
/// Structural equality against every accepted answer, passing on the first match.
/// Objects compare key-order independent, integers exactly, floats within a relative
/// tolerance. Problems flagged `unordered_output` compare sequences as multisets.
use codeduel_common::types::{TestCase, TestCaseResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Error text for a case whose run exceeded its wall-clock limit
pub const TIMEOUT_ERROR: &str = "timeout";

/// Prefix of the per-case error for code that never compiled
pub const COMPILE_FAILED_PREFIX: &str = "Compilation failed: ";

const FLOAT_TOLERANCE: f64 = 1e-9;

/// One result line as printed by a harness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time: Option<f64>,
}

impl GuestResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            execution_time: None,
        }
    }

    /// Accept a decoded JSON value if it has the result shape
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let success = object.get("success")?.as_bool()?;
        let error = match object.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Some(Self {
            success,
            output: object.get("output").cloned().unwrap_or(Value::Null),
            error,
            execution_time: object.get("execution_time").and_then(Value::as_f64),
        })
    }
}

/// Extract result lines from stdout, ignoring everything else
pub fn parse_result_lines(stdout: &str) -> Vec<GuestResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|value| GuestResult::from_value(&value))
        .collect()
}

/// Pad (or cut) to exactly `expected` results; padding uses `filler`
pub fn pad_results(mut results: Vec<GuestResult>, expected: usize, filler: &str) -> Vec<GuestResult> {
    results.truncate(expected);
    while results.len() < expected {
        results.push(GuestResult::failure(filler));
    }
    results
}

/// Message for cases that never printed a result
pub fn missing_result(detail: &str) -> String {
    if detail.is_empty() {
        "missing result".to_string()
    } else {
        format!("missing result ({})", detail)
    }
}

/// Parse string-encoded arrays/objects into structure
pub fn normalize_output(value: &Value) -> Value {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                return parsed;
            }
        }
    }
    value.clone()
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            let scale = 1f64.max(x.abs()).max(y.abs());
            (x - y).abs() <= FLOAT_TOLERANCE * scale
        }
        _ => false,
    }
}

/// Structural equality: key-order independent objects, tolerant floats
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Order-insensitive form: every array sorted after its elements are canonicalized
fn canonical(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonical).collect();
            items.sort_by_cached_key(|v| v.to_string());
            Value::Array(items)
        }
        Value::Object(map) => {
            let map: Map<String, Value> = map.iter().map(|(k, v)| (k.clone(), canonical(v))).collect();
            Value::Object(map)
        }
        Value::Number(n) => match n.as_f64() {
            // 2.0 and 2 must sort identically
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Compare one actual output against one accepted answer
pub fn output_matches(actual: &Value, expected: &Value, unordered: bool) -> bool {
    if unordered {
        values_equal(&canonical(actual), &canonical(expected))
    } else {
        values_equal(actual, expected)
    }
}

/// Pass if the actual output (raw or normalized) matches any accepted answer
pub fn matches_any(actual: &Value, expected: &[Value], unordered: bool) -> bool {
    let normalized = normalize_output(actual);
    expected.iter().any(|answer| {
        output_matches(actual, answer, unordered) || output_matches(&normalized, answer, unordered)
    })
}

/// Verdicts for `cases`, paired index by index with `results`
///
/// ## Returns
/// `(per-case results, passed, failed)`
pub fn evaluate(
    cases: &[TestCase],
    results: Vec<GuestResult>,
    unordered: bool,
) -> (Vec<TestCaseResult>, usize, usize) {
    let results = pad_results(results, cases.len(), &missing_result(""));
    let mut verdicts = Vec::with_capacity(cases.len());
    let mut passed = 0;

    for (case, result) in cases.iter().zip(results) {
        let verdict = if result.success {
            let ok = matches_any(&result.output, &case.expected, unordered);
            TestCaseResult {
                input: case.input.clone(),
                expected_output: case.expected.clone(),
                actual_output: Some(result.output),
                passed: ok,
                error: None,
                execution_time_ms: result.execution_time,
            }
        } else {
            TestCaseResult {
                input: case.input.clone(),
                expected_output: case.expected.clone(),
                actual_output: None,
                passed: false,
                error: Some(result.error.unwrap_or_else(|| "unknown error".to_string())),
                execution_time_ms: result.execution_time,
            }
        };
        if verdict.passed {
            passed += 1;
        }
        verdicts.push(verdict);
    }

    let failed = verdicts.len() - passed;
    (verdicts, passed, failed)
}

/// Every case fails with the same compiler diagnostic
pub fn compile_failure(count: usize, diagnostic: &str) -> Vec<GuestResult> {
    let error = format!("{}{}", COMPILE_FAILED_PREFIX, diagnostic.trim());
    vec![GuestResult::failure(error); count]
}
