//! Harness Generator - User Code to Runnable Program
//!
//! **Core Responsibility:**
//! Build complete program source from a raw user function, the problem signature and
//! one or many test inputs.
//!
//! **Assembly:**
//! Each language owns a handlebars skeleton (imports, type defs, user code, decode,
//! invoke, encode, driver loop). Fragments are built in Rust and spliced in verbatim;
//! the only escaping step is the language's `string_literal`, applied once to each
//! embedded input. Fixed guest-side JSON support ships from `guest/` unchanged.
//!
//! **Wire Format (one line per test case):**
//! `{"success": bool, "output": <value|null>, "error": <string|null>, "execution_time": <ms|null>}`
//!
//! **Inputs:**
//! The generated program reads a JSON array of input objects from its first
//! command-line argument when present, otherwise iterates the embedded cases.
pub mod cpp;
pub mod java;
pub mod javascript;
pub mod python;
pub(crate) mod scan;

use crate::error::{EngineError, Result};
use crate::registry::{is_identifier, Signature};
use codeduel_common::types::Language;
use handlebars::Handlebars;
use serde_json::{Map, Value};

/// Where the generated program gets its inputs
#[derive(Debug, Clone, Copy)]
pub enum CaseSource<'a> {
    /// Inputs compiled into the program (compile-once batches)
    Embedded(&'a [Map<String, Value>]),
    /// Inputs supplied at run time as one JSON array argument
    Argv,
}

impl CaseSource<'_> {
    pub fn embedded(&self) -> &[Map<String, Value>] {
        match self {
            CaseSource::Embedded(cases) => cases,
            CaseSource::Argv => &[],
        }
    }
}

/// Everything a generator needs
#[derive(Debug, Clone, Copy)]
pub struct HarnessRequest<'a> {
    pub user_code: &'a str,
    pub function_name: &'a str,
    pub signature: &'a Signature,
    pub cases: CaseSource<'a>,
}

impl HarnessRequest<'_> {
    fn validate(&self) -> Result<()> {
        if !is_identifier(self.function_name) {
            return Err(EngineError::InvalidSubmission(format!(
                "function name '{}' is not a valid identifier",
                self.function_name
            )));
        }
        self.signature
            .validate()
            .map_err(EngineError::Configuration)
    }
}

/// Per-language harness generation
pub trait HarnessGenerator: Send + Sync {
    fn language(&self) -> Language;

    /// Encode `raw` as a source literal of this language
    fn string_literal(&self, raw: &str) -> String;

    /// Produce complete program source
    fn generate(&self, request: &HarnessRequest<'_>) -> Result<String>;
}

/// Generator for a language
pub fn generator_for(language: Language) -> Result<Box<dyn HarnessGenerator>> {
    let generator: Box<dyn HarnessGenerator> = match language {
        Language::Python => Box::new(python::PythonHarness::new()?),
        Language::JavaScript => Box::new(javascript::JavaScriptHarness::new()?),
        Language::Java => Box::new(java::JavaHarness::new()?),
        Language::Cpp => Box::new(cpp::CppHarness::new()?),
    };
    Ok(generator)
}

/// Template registry for one skeleton: strict, no HTML escaping
pub(crate) fn skeleton(name: &str, template: &str) -> Result<Handlebars<'static>> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string(name, template)
        .map_err(|e| EngineError::Configuration(format!("invalid {} template: {}", name, e)))?;
    Ok(handlebars)
}

/// Embedded inputs rendered as one literal per case, joined with `separator`
pub(crate) fn embedded_literals(
    generator: &dyn HarnessGenerator,
    cases: &[Map<String, Value>],
    indent: &str,
    separator: &str,
) -> Result<String> {
    let mut rendered = Vec::with_capacity(cases.len());
    for case in cases {
        let raw = serde_json::to_string(case)?;
        rendered.push(format!("{}{}", indent, generator.string_literal(&raw)));
    }
    Ok(rendered.join(separator))
}

/// String literal valid in both Python and JavaScript: a JSON string
pub(crate) fn json_string_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Indent every non-empty line of `block`
pub(crate) fn indent(block: &str, prefix: &str) -> String {
    block
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", prefix, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_string_literal() {
        assert_eq!(json_string_literal(r#"{"s":"a\"b"}"#), r#""{\"s\":\"a\\\"b\"}""#);
        assert_eq!(json_string_literal("line\nbreak"), r#""line\nbreak""#);
        assert_eq!(json_string_literal("\u{1}"), r#""\u0001""#);
        assert_eq!(json_string_literal("héllo"), "\"héllo\"");
    }

    #[test]
    fn test_literal_round_trips_through_json() {
        let raw = "{\"words\":[\"a\\\\b\",\"tab\\t\",\"quote\\\"\"]}";
        let literal = json_string_literal(raw);
        let decoded: String = serde_json::from_str(&literal).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_indent_skips_blank_lines() {
        assert_eq!(indent("a\n\nb", "  "), "  a\n\n  b");
    }

    #[test]
    fn test_every_language_has_a_generator() {
        for language in Language::ALL {
            let generator = generator_for(language).unwrap();
            assert_eq!(generator.language(), language);
        }
    }
}
