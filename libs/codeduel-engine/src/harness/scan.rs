// Lightweight source scanning used to neutralize user declarations before splicing
use crate::error::{EngineError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Compiled patterns shared by all generators
pub(crate) struct Patterns {
    pub py_main_guard: Regex,
    pub py_list_node: Regex,
    pub py_tree_node: Regex,
    pub js_list_node: Regex,
    pub js_tree_node: Regex,
    pub java_solution: Regex,
    pub java_list_node: Regex,
    pub java_tree_node: Regex,
    pub java_import: Regex,
    pub java_package: Regex,
    pub java_public_type: Regex,
    pub cpp_solution: Regex,
    pub cpp_list_node: Regex,
    pub cpp_tree_node: Regex,
    pub cpp_main: Regex,
}

impl Patterns {
    fn build() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            py_main_guard: Regex::new(r#"(?m)^if\s+__name__\s*==\s*['"]__main__['"]\s*:"#)?,
            py_list_node: Regex::new(r"(?m)^class\s+ListNode\b")?,
            py_tree_node: Regex::new(r"(?m)^class\s+TreeNode\b")?,
            js_list_node: Regex::new(r"\b(?:class|function)\s+ListNode\b|\b(?:const|let|var)\s+ListNode\s*=")?,
            js_tree_node: Regex::new(r"\b(?:class|function)\s+TreeNode\b|\b(?:const|let|var)\s+TreeNode\s*=")?,
            java_solution: Regex::new(r"\bclass\s+Solution\b")?,
            java_list_node: Regex::new(r"\bclass\s+ListNode\b")?,
            java_tree_node: Regex::new(r"\bclass\s+TreeNode\b")?,
            java_import: Regex::new(r"^\s*import\s+(?:static\s+)?[\w.]+(?:\.\*)?\s*;\s*$")?,
            java_package: Regex::new(r"^\s*package\s+[\w.]+\s*;\s*$")?,
            java_public_type: Regex::new(
                r"^(\s*)public\s+((?:(?:final|abstract|static|strictfp)\s+)*(?:class|interface|enum|@interface)\b)",
            )?,
            cpp_solution: Regex::new(r"\b(?:class|struct)\s+Solution\b")?,
            cpp_list_node: Regex::new(r"\bstruct\s+ListNode\s*\{|\bclass\s+ListNode\s*\{")?,
            cpp_tree_node: Regex::new(r"\bstruct\s+TreeNode\s*\{|\bclass\s+TreeNode\s*\{")?,
            cpp_main: Regex::new(r"\bint\s+main\s*\(")?,
        })
    }
}

pub(crate) fn patterns() -> Result<&'static Patterns> {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    if let Some(patterns) = PATTERNS.get() {
        return Ok(patterns);
    }
    let built = Patterns::build()
        .map_err(|e| EngineError::Configuration(format!("harness pattern failed to compile: {}", e)))?;
    Ok(PATTERNS.get_or_init(|| built))
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Literal(char),
}

/// Result of scanning C-family source
pub(crate) struct Scan {
    /// Source with comment bodies replaced by spaces; newlines and literals preserved
    pub blanked: String,
    /// Brace depth at the start of each line
    pub depths: Vec<usize>,
}

/// Scan C-family source (Java, C++, JavaScript) tracking comments, literals and brace depth
pub(crate) fn scan_c_family(code: &str) -> Scan {
    let mut blanked = String::with_capacity(code.len());
    let mut depths = vec![0];
    let mut depth: usize = 0;
    let mut state = State::Code;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    blanked.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    blanked.push_str("  ");
                    state = State::BlockComment;
                }
                '"' | '\'' | '`' => {
                    blanked.push(c);
                    state = State::Literal(c);
                }
                '{' => {
                    depth += 1;
                    blanked.push(c);
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    blanked.push(c);
                }
                _ => blanked.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    blanked.push('\n');
                    state = State::Code;
                } else {
                    blanked.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    blanked.push_str("  ");
                    state = State::Code;
                } else if c == '\n' {
                    blanked.push('\n');
                } else {
                    blanked.push(' ');
                }
            }
            State::Literal(quote) => {
                blanked.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        blanked.push(next);
                        if next == '\n' {
                            depths.push(depth);
                        }
                    }
                } else if c == quote {
                    state = State::Code;
                } else if c == '\n' && quote != '`' {
                    // Unterminated literal; resync at end of line
                    state = State::Code;
                }
            }
        }
        if c == '\n' {
            depths.push(depth);
        }
    }

    Scan { blanked, depths }
}

/// Source split into lines, each paired with its brace depth
pub(crate) fn lines_with_depth(code: &str) -> Vec<(usize, &str)> {
    let scan = scan_c_family(code);
    code.split('\n')
        .enumerate()
        .map(|(i, line)| (scan.depths.get(i).copied().unwrap_or(0), line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_are_blanked() {
        let code = "/* struct ListNode { int val; }; */\nint x; // class Solution\n";
        let scan = scan_c_family(code);
        assert!(!scan.blanked.contains("ListNode"));
        assert!(!scan.blanked.contains("Solution"));
        assert!(scan.blanked.contains("int x;"));
        assert_eq!(scan.blanked.len(), code.len());
    }

    #[test]
    fn test_depth_ignores_braces_in_literals() {
        let code = "class A {\n  String s = \"{{\";\n  char c = '}';\n}\nint main() {\n}\n";
        let depths: Vec<usize> = lines_with_depth(code).into_iter().map(|(d, _)| d).collect();
        assert_eq!(depths, vec![0, 1, 1, 1, 0, 1, 0]);
    }

    #[test]
    fn test_patterns_compile() {
        let p = patterns().unwrap();
        assert!(p.py_main_guard.is_match("if __name__ == '__main__':\n    main()"));
        assert!(p.cpp_main.is_match("int main() {"));
        assert!(p.java_public_type.is_match("public final class Solution {"));
        assert!(!p.java_public_type.is_match("public int twoSum() {"));
    }
}
