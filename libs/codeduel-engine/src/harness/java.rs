/// Java Harness Generator
///
/// **Core Responsibility:**
/// Turn a LeetCode-style `Solution` body into a single `CdHarness.java` compilation unit.
///
/// **Source Rewriting:**
/// - `package` lines are dropped, `import` lines are hoisted above the defaults
/// - `public` is stripped from top-level types (the file is named after `CdHarness`)
/// - Code without a `class Solution` is wrapped in one
/// - `ListNode` / `TreeNode` are injected when the signature needs them and the user
///   did not declare them
///
/// **Embedding:**
/// Each embedded case is split into chunks joined at run time, keeping every
/// string constant under the class-file limit.
use super::{indent, scan, skeleton, HarnessGenerator, HarnessRequest};
use crate::error::Result;
use crate::registry::ParamType;
use codeduel_common::types::Language;
use handlebars::Handlebars;
use serde_json::json;

/// JSON support shared by the harness and the persistent worker
pub const CDJSON_SOURCE: &str = include_str!("../guest/CdJson.java");

/// Persistent worker entry point, compiled once per container
pub const WORKER_SOURCE: &str = include_str!("../guest/CdWorker.java");

/// Class holding the generated driver (and the source file name)
pub const HARNESS_CLASS: &str = "CdHarness";

const CHUNK_CHARS: usize = 10_000;

const DEFAULT_IMPORTS: [&str; 4] = [
    "import java.util.*;",
    "import java.util.function.*;",
    "import java.util.stream.*;",
    "import java.math.*;",
];

const TEMPLATE: &str = r#"{{{imports}}}

{{{type_defs}}}

{{{user_code}}}

{{{support}}}

final class CdHarness {
    private static final String[][] CASES = new String[][] {
{{{embedded_cases}}}
    };
{{{node_codecs}}}

    static String runCase(String cdRaw) {
        long cdStarted = System.nanoTime();
        try {
            Map<String, Object> cdArgs = CdJson.object(CdJson.parse(cdRaw), "test input");
{{{decode}}}
            Solution cdSolution = new Solution();
            cdStarted = System.nanoTime();
{{{invoke}}}
            double cdElapsed = (System.nanoTime() - cdStarted) / 1e6;
            return CdJson.result(true, {{{encode}}}, null, cdElapsed);
        } catch (CdJson.DecodeException e) {
            return CdJson.result(false, null, "DecodeError: " + e.getMessage(), null);
        } catch (Throwable e) {
            double cdElapsed = (System.nanoTime() - cdStarted) / 1e6;
            return CdJson.result(false, null, e.getClass().getSimpleName() + ": " + e.getMessage(), cdElapsed);
        }
    }

    public static void main(String[] args) {
        List<String> inputs = new ArrayList<>();
        if (args.length > 0) {
            for (Object item : CdJson.array(CdJson.parse(args[0]), "inputs")) {
                inputs.add(CdJson.stringify(item));
            }
        } else {
            for (String[] parts : CASES) {
                inputs.add(String.join("", parts));
            }
        }
        for (String raw : inputs) {
            System.out.println(runCase(raw));
            System.out.flush();
        }
    }
}
"#;

const LIST_NODE: &str = r#"class ListNode {
    int val;
    ListNode next;
    ListNode() {}
    ListNode(int val) { this.val = val; }
    ListNode(int val, ListNode next) { this.val = val; this.next = next; }
}"#;

const TREE_NODE: &str = r#"class TreeNode {
    int val;
    TreeNode left;
    TreeNode right;
    TreeNode() {}
    TreeNode(int val) { this.val = val; }
    TreeNode(int val, TreeNode left, TreeNode right) {
        this.val = val;
        this.left = left;
        this.right = right;
    }
}"#;

const LIST_NODE_CODECS: &str = r#"
static ListNode cdListNode(Object v, String name) {
    List<Object> items = CdJson.array(v, name);
    ListNode head = null;
    for (int i = items.size() - 1; i >= 0; i--) {
        ListNode node = new ListNode(CdJson.toInt(items.get(i), name));
        node.next = head;
        head = node;
    }
    return head;
}

static ListNode[] cdListNodes(Object v, String name) {
    List<Object> items = CdJson.array(v, name);
    ListNode[] out = new ListNode[items.size()];
    for (int i = 0; i < out.length; i++) {
        out[i] = cdListNode(items.get(i), name);
    }
    return out;
}

static List<Integer> cdEncodeListNode(ListNode head) {
    List<Integer> out = new ArrayList<>();
    while (head != null) {
        out.add(head.val);
        head = head.next;
        if (out.size() > 100000) {
            throw new IllegalStateException("linked list is cyclic or too long");
        }
    }
    return out;
}

static List<List<Integer>> cdEncodeListNodes(ListNode[] heads) {
    List<List<Integer>> out = new ArrayList<>();
    if (heads == null) {
        return out;
    }
    for (ListNode head : heads) {
        out.add(cdEncodeListNode(head));
    }
    return out;
}"#;

const TREE_NODE_CODECS: &str = r#"
static TreeNode cdTreeNode(Object v, String name) {
    List<Object> items = CdJson.array(v, name);
    if (items.isEmpty() || items.get(0) == null) {
        return null;
    }
    TreeNode root = new TreeNode(CdJson.toInt(items.get(0), name));
    ArrayDeque<TreeNode> queue = new ArrayDeque<>();
    queue.add(root);
    int i = 1;
    while (!queue.isEmpty() && i < items.size()) {
        TreeNode node = queue.poll();
        if (i < items.size() && items.get(i) != null) {
            node.left = new TreeNode(CdJson.toInt(items.get(i), name));
            queue.add(node.left);
        }
        i++;
        if (i < items.size() && items.get(i) != null) {
            node.right = new TreeNode(CdJson.toInt(items.get(i), name));
            queue.add(node.right);
        }
        i++;
    }
    return root;
}

static List<Integer> cdEncodeTreeNode(TreeNode root) {
    List<Integer> out = new ArrayList<>();
    LinkedList<TreeNode> queue = new LinkedList<>();
    if (root != null) {
        queue.add(root);
    }
    while (!queue.isEmpty()) {
        TreeNode node = queue.poll();
        if (node == null) {
            out.add(null);
            continue;
        }
        out.add(node.val);
        queue.add(node.left);
        queue.add(node.right);
    }
    while (!out.isEmpty() && out.get(out.size() - 1) == null) {
        out.remove(out.size() - 1);
    }
    return out;
}"#;

pub struct JavaHarness {
    templates: Handlebars<'static>,
}

/// User source after rewriting
struct Rewritten {
    imports: Vec<String>,
    body: String,
}

impl JavaHarness {
    pub fn new() -> Result<Self> {
        Ok(Self {
            templates: skeleton("java", TEMPLATE)?,
        })
    }

    /// Java type used to declare a decoded parameter
    pub fn java_type(ty: ParamType) -> &'static str {
        match ty {
            ParamType::Int => "int",
            ParamType::Long => "long",
            ParamType::Double => "double",
            ParamType::Bool => "boolean",
            ParamType::Str => "String",
            ParamType::CharArray => "char[]",
            ParamType::IntArray => "int[]",
            ParamType::LongArray => "long[]",
            ParamType::DoubleArray => "double[]",
            ParamType::BoolArray => "boolean[]",
            ParamType::StrArray => "String[]",
            ParamType::IntMatrix => "int[][]",
            ParamType::StrMatrix => "String[][]",
            ParamType::CharMatrix => "char[][]",
            ParamType::IntList => "List<Integer>",
            ParamType::StrList => "List<String>",
            ParamType::IntListList => "List<List<Integer>>",
            ParamType::StrListList => "List<List<String>>",
            ParamType::ListNode => "ListNode",
            ParamType::TreeNode => "TreeNode",
            ParamType::ListNodeArray => "ListNode[]",
            ParamType::Void => "void",
        }
    }

    fn decoder(ty: ParamType) -> &'static str {
        match ty {
            ParamType::Int => "CdJson.toInt",
            ParamType::Long => "CdJson.toLong",
            ParamType::Double => "CdJson.toDouble",
            ParamType::Bool => "CdJson.toBool",
            ParamType::Str | ParamType::Void => "CdJson.toStr",
            ParamType::CharArray => "CdJson.toCharArray",
            ParamType::IntArray => "CdJson.toIntArray",
            ParamType::LongArray => "CdJson.toLongArray",
            ParamType::DoubleArray => "CdJson.toDoubleArray",
            ParamType::BoolArray => "CdJson.toBoolArray",
            ParamType::StrArray => "CdJson.toStrArray",
            ParamType::IntMatrix => "CdJson.toIntMatrix",
            ParamType::StrMatrix => "CdJson.toStrMatrix",
            ParamType::CharMatrix => "CdJson.toCharMatrix",
            ParamType::IntList => "CdJson.toIntList",
            ParamType::StrList => "CdJson.toStrList",
            ParamType::IntListList => "CdJson.toIntListList",
            ParamType::StrListList => "CdJson.toStrListList",
            ParamType::ListNode => "cdListNode",
            ParamType::TreeNode => "cdTreeNode",
            ParamType::ListNodeArray => "cdListNodes",
        }
    }

    fn encoder(ty: ParamType, var: &str) -> String {
        match ty {
            ParamType::ListNode => format!("cdEncodeListNode({})", var),
            ParamType::TreeNode => format!("cdEncodeTreeNode({})", var),
            ParamType::ListNodeArray => format!("cdEncodeListNodes({})", var),
            _ => var.to_string(),
        }
    }

    fn rewrite(code: &str) -> Result<Rewritten> {
        let patterns = scan::patterns()?;
        let scan = scan::scan_c_family(code);
        let mut imports = Vec::new();
        let mut body = Vec::new();

        for (i, (line, visible)) in code.split('\n').zip(scan.blanked.split('\n')).enumerate() {
            let depth = scan.depths.get(i).copied().unwrap_or(0);
            if depth == 0 && patterns.java_package.is_match(visible) {
                continue;
            }
            if depth == 0 && patterns.java_import.is_match(visible) {
                let import = line.trim().to_string();
                if !imports.contains(&import) && !DEFAULT_IMPORTS.contains(&import.as_str()) {
                    imports.push(import);
                }
                continue;
            }
            if depth == 0 && patterns.java_public_type.is_match(visible) {
                body.push(patterns.java_public_type.replace(line, "$1$2").into_owned());
                continue;
            }
            body.push(line.to_string());
        }

        let mut body = body.join("\n");
        if !patterns.java_solution.is_match(&scan.blanked) {
            body = format!("class Solution {{\n{}\n}}", indent(&body, "    "));
        }
        Ok(Rewritten { imports, body })
    }

    /// `{"chunk", "chunk"}` initializer for one embedded case
    fn case_initializer(&self, raw: &str) -> String {
        let chars: Vec<char> = raw.chars().collect();
        let chunks: Vec<String> = if chars.is_empty() {
            vec![self.string_literal("")]
        } else {
            chars
                .chunks(CHUNK_CHARS)
                .map(|chunk| self.string_literal(&chunk.iter().collect::<String>()))
                .collect()
        };
        format!("{{{}}}", chunks.join(", "))
    }
}

impl HarnessGenerator for JavaHarness {
    fn language(&self) -> Language {
        Language::Java
    }

    /// Java string literal using octal escapes for control characters and
    /// unicode escapes for everything outside ASCII
    fn string_literal(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len() + 2);
        out.push('"');
        for c in raw.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 || c == '\u{7f}' => {
                    out.push_str(&format!("\\{:03o}", c as u32));
                }
                c if c.is_ascii() => out.push(c),
                c => {
                    let mut units = [0u16; 2];
                    for unit in c.encode_utf16(&mut units) {
                        out.push_str(&format!("\\u{:04x}", unit));
                    }
                }
            }
        }
        out.push('"');
        out
    }

    fn generate(&self, request: &HarnessRequest<'_>) -> Result<String> {
        request.validate()?;
        let signature = request.signature;
        let patterns = scan::patterns()?;
        let rewritten = Self::rewrite(request.user_code)?;
        let visible = scan::scan_c_family(request.user_code).blanked;

        let mut imports: Vec<String> = DEFAULT_IMPORTS.iter().map(|s| s.to_string()).collect();
        imports.extend(rewritten.imports);

        let mut type_defs = Vec::new();
        let mut node_codecs = Vec::new();
        if signature.needs_list_node() {
            if !patterns.java_list_node.is_match(&visible) {
                type_defs.push(LIST_NODE);
            }
            node_codecs.push(LIST_NODE_CODECS);
        }
        if signature.needs_tree_node() {
            if !patterns.java_tree_node.is_match(&visible) {
                type_defs.push(TREE_NODE);
            }
            node_codecs.push(TREE_NODE_CODECS);
        }

        let decode = signature
            .params
            .iter()
            .map(|p| {
                let name = self.string_literal(&p.name);
                format!(
                    "{} {} = {}(CdJson.field(cdArgs, {}), {});",
                    Self::java_type(p.ty),
                    p.name,
                    Self::decoder(p.ty),
                    name,
                    name
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let args = signature
            .params
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let call = format!("cdSolution.{}({})", request.function_name, args);
        let (invoke, output_var) = match &signature.output_param {
            Some(param) => (format!("{};", call), param.clone()),
            None => {
                let output = signature.output_type();
                let declared = if output.uses_list_node() || output.uses_tree_node() {
                    Self::java_type(output)
                } else {
                    "Object"
                };
                (format!("{} cdResult = {};", declared, call), "cdResult".to_string())
            }
        };

        let mut embedded = Vec::new();
        for case in request.cases.embedded() {
            let raw = serde_json::to_string(case)?;
            embedded.push(format!("        {}", self.case_initializer(&raw)));
        }

        let data = json!({
            "imports": imports.join("\n"),
            "type_defs": type_defs.join("\n\n"),
            "user_code": rewritten.body,
            "support": CDJSON_SOURCE,
            "embedded_cases": embedded.join(",\n"),
            "node_codecs": indent(&node_codecs.join("\n"), "    "),
            "decode": indent(&decode, "            "),
            "invoke": indent(&invoke, "            "),
            "encode": Self::encoder(signature.output_type(), &output_var),
        });
        Ok(self.templates.render("java", &data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::CaseSource;
    use crate::registry::{Param, Signature};
    use serde_json::{Map, Value};

    fn missing_number() -> Signature {
        Signature {
            params: vec![Param { name: "nums".into(), ty: ParamType::IntArray }],
            returns: ParamType::Int,
            output_param: None,
        }
    }

    fn generate(code: &str, sig: &Signature, cases: CaseSource<'_>) -> String {
        JavaHarness::new()
            .unwrap()
            .generate(&HarnessRequest {
                user_code: code,
                function_name: "missingNumber",
                signature: sig,
                cases,
            })
            .unwrap()
    }

    #[test]
    fn test_rewrites_public_class_and_imports() {
        let code = "package leetcode;\nimport java.util.*;\nimport java.util.concurrent.atomic.AtomicInteger;\n\npublic class Solution {\n    public int missingNumber(int[] nums) {\n        return 0;\n    }\n}\n";
        let sig = missing_number();
        let source = generate(code, &sig, CaseSource::Argv);

        assert!(!source.contains("package leetcode;"));
        assert!(!source.contains("public class Solution"));
        assert!(source.contains("class Solution {\n    public int missingNumber"));
        assert_eq!(source.matches("import java.util.*;").count(), 1);
        assert!(source.starts_with("import java.util.*;"));
        assert!(source.contains("import java.util.concurrent.atomic.AtomicInteger;"));
        assert!(source.contains(r#"int[] nums = CdJson.toIntArray(CdJson.field(cdArgs, "nums"), "nums");"#));
        assert!(source.contains("Object cdResult = cdSolution.missingNumber(nums);"));
        assert!(source.contains("final class CdJson"));
    }

    #[test]
    fn test_param_names_do_not_clash_with_driver_locals() {
        let sig = Signature {
            params: vec![
                Param { name: "started".into(), ty: ParamType::Int },
                Param { name: "elapsed".into(), ty: ParamType::Int },
                Param { name: "raw".into(), ty: ParamType::Str },
            ],
            returns: ParamType::Int,
            output_param: None,
        };
        let source = generate(
            "int missingNumber(int started, int elapsed, String raw) { return started; }",
            &sig,
            CaseSource::Argv,
        );
        assert!(source.contains(r#"int started = CdJson.toInt(CdJson.field(cdArgs, "started"), "started");"#));
        assert!(source.contains("cdSolution.missingNumber(started, elapsed, raw)"));
        assert!(source.contains("static String runCase(String cdRaw)"));
        assert!(!source.contains("long started"));
        assert!(!source.contains("double elapsed"));
    }

    #[test]
    fn test_bare_method_is_wrapped_in_solution() {
        let sig = missing_number();
        let source = generate(
            "public int missingNumber(int[] nums) {\n    return 0;\n}",
            &sig,
            CaseSource::Argv,
        );
        assert!(source.contains("class Solution {\n    public int missingNumber(int[] nums) {"));
    }

    #[test]
    fn test_commented_solution_still_wrapped() {
        let sig = missing_number();
        let source = generate(
            "// class Solution is provided\npublic int missingNumber(int[] nums) { return 0; }",
            &sig,
            CaseSource::Argv,
        );
        assert!(source.contains("class Solution {\n    // class Solution is provided"));
    }

    #[test]
    fn test_embedded_cases_are_chunked() {
        let sig = missing_number();
        let big: Vec<Value> = (0..4000).map(Value::from).collect();
        let mut case = Map::new();
        case.insert("nums".to_string(), Value::Array(big));
        let cases = vec![case];
        let source = generate("class Solution { int missingNumber(int[] nums) { return 0; } }", &sig, CaseSource::Embedded(&cases));

        let start = source.find("CASES = new String[][] {\n").unwrap();
        let line = source[start..].lines().nth(1).unwrap();
        assert!(line.trim_start().starts_with("{\""));
        assert!(line.matches("\", \"").count() >= 1);
        assert!(line.contains("{\\\"nums\\\":[0,1,2"));
    }

    #[test]
    fn test_string_literal_escapes() {
        let generator = JavaHarness::new().unwrap();
        assert_eq!(generator.string_literal("a\"b\\c"), r#""a\"b\\c""#);
        assert_eq!(generator.string_literal("\u{1}"), r#""\001""#);
        assert_eq!(generator.string_literal("é"), r#""\u00e9""#);
        assert_eq!(generator.string_literal("😀"), r#""\ud83d\ude00""#);
    }

    #[test]
    fn test_list_node_codecs_follow_signature() {
        let sig = Signature {
            params: vec![Param { name: "head".into(), ty: ParamType::ListNode }],
            returns: ParamType::ListNode,
            output_param: None,
        };
        let source = JavaHarness::new()
            .unwrap()
            .generate(&HarnessRequest {
                user_code: "class Solution { public ListNode reverseList(ListNode head) { return head; } }",
                function_name: "reverseList",
                signature: &sig,
                cases: CaseSource::Argv,
            })
            .unwrap();
        assert!(source.contains("class ListNode {\n    int val;"));
        assert!(source.contains("static ListNode cdListNode(Object v, String name)"));
        assert!(source.contains("ListNode cdResult = cdSolution.reverseList(head);"));
        assert!(source.contains("CdJson.result(true, cdEncodeListNode(cdResult), null, cdElapsed)"));
        assert!(!source.contains("class TreeNode"));
    }

    #[test]
    fn test_cdjson_prints_ascii_only() {
        // Non-ASCII output must not depend on the JVM default charset
        assert!(CDJSON_SOURCE.contains("if (c < 0x20 || c > 0x7e)"));
        assert!(CDJSON_SOURCE.contains("String.format(\"\\\\u%04x\", (int) c)"));
    }
}
