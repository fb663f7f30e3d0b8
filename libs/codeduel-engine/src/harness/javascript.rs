// JavaScript harness: node script driving a user function or Solution class
use super::{embedded_literals, indent, json_string_literal, scan, skeleton, HarnessGenerator, HarnessRequest};
use crate::error::Result;
use crate::registry::ParamType;
use codeduel_common::types::Language;
use handlebars::Handlebars;
use serde_json::json;

const TEMPLATE: &str = r#"{{{type_defs}}}

{{{user_code}}}

class __CdDecodeError extends Error {}

const __CD_CASES = [
{{{embedded_cases}}}
];

function __cdField(args, name) {
  if (!Object.prototype.hasOwnProperty.call(args, name)) {
    throw new __CdDecodeError("missing required field '" + name + "'");
  }
  return args[name];
}

function __cdExpect(ok, name, what) {
  if (!ok) {
    throw new __CdDecodeError("field '" + name + "' must be " + what);
  }
}

function __cdInt(v, name) {
  __cdExpect(Number.isInteger(v), name, "an integer");
  return v;
}

function __cdNumber(v, name) {
  __cdExpect(typeof v === "number", name, "a number");
  return v;
}

function __cdBool(v, name) {
  __cdExpect(typeof v === "boolean", name, "a boolean");
  return v;
}

function __cdStr(v, name) {
  __cdExpect(typeof v === "string", name, "a string");
  return v;
}

function __cdChar(v, name) {
  __cdExpect(typeof v === "string" && v.length === 1, name, "a single character");
  return v;
}

function __cdList(item) {
  return (v, name) => {
    __cdExpect(Array.isArray(v), name, "an array");
    return v.map((x) => item(x, name));
  };
}

function __cdListNode(v, name) {
  let head = null;
  const values = __cdList(__cdInt)(v, name);
  for (let i = values.length - 1; i >= 0; i--) {
    head = new ListNode(values[i], head);
  }
  return head;
}

function __cdTreeNode(v, name) {
  __cdExpect(Array.isArray(v), name, "a level-order array");
  if (v.length === 0 || v[0] === null) {
    return null;
  }
  const root = new TreeNode(__cdInt(v[0], name));
  const queue = [root];
  let i = 1;
  while (queue.length > 0 && i < v.length) {
    const node = queue.shift();
    if (i < v.length && v[i] !== null) {
      node.left = new TreeNode(__cdInt(v[i], name));
      queue.push(node.left);
    }
    i++;
    if (i < v.length && v[i] !== null) {
      node.right = new TreeNode(__cdInt(v[i], name));
      queue.push(node.right);
    }
    i++;
  }
  return root;
}

function __cdEncodeListNode(head) {
  const out = [];
  while (head !== null && head !== undefined) {
    out.push(head.val);
    head = head.next;
    if (out.length > 100000) {
      throw new RangeError("linked list is cyclic or too long");
    }
  }
  return out;
}

function __cdEncodeTreeNode(root) {
  const out = [];
  const queue = root === null || root === undefined ? [] : [root];
  while (queue.length > 0) {
    const node = queue.shift();
    if (node === null || node === undefined) {
      out.push(null);
      continue;
    }
    out.push(node.val);
    queue.push(node.left === undefined ? null : node.left);
    queue.push(node.right === undefined ? null : node.right);
  }
  while (out.length > 0 && out[out.length - 1] === null) {
    out.pop();
  }
  return out;
}

function __cdTarget() {
  if (typeof Solution === "function" && typeof Solution.prototype["{{function_name}}"] === "function") {
    const instance = new Solution();
    return instance["{{function_name}}"].bind(instance);
  }
  if (typeof {{function_name}} === "function") {
    return {{function_name}};
  }
  throw new ReferenceError("function '{{function_name}}' is not defined");
}

function __cdOut(value) {
  return value === undefined ? null : value;
}

function __cdRunCase(raw) {
  let started = process.hrtime.bigint();
  try {
    const __cdArgs = typeof raw === "string" ? JSON.parse(raw) : raw;
    if (__cdArgs === null || typeof __cdArgs !== "object" || Array.isArray(__cdArgs)) {
      throw new __CdDecodeError("test input must be a JSON object");
    }
{{{decode}}}
    const __cdFn = __cdTarget();
    started = process.hrtime.bigint();
{{{invoke}}}
    const elapsed = Number(process.hrtime.bigint() - started) / 1e6;
    return { success: true, output: __cdOut({{{encode}}}), error: null, execution_time: elapsed };
  } catch (e) {
    if (e instanceof __CdDecodeError) {
      return { success: false, output: null, error: "DecodeError: " + e.message, execution_time: null };
    }
    const elapsed = Number(process.hrtime.bigint() - started) / 1e6;
    const name = e && e.name ? e.name : "Error";
    const message = e && e.message !== undefined ? e.message : String(e);
    return { success: false, output: null, error: name + ": " + message, execution_time: elapsed };
  }
}

function __cdMain() {
  const cases = process.argv.length > 2 ? JSON.parse(process.argv[2]) : __CD_CASES;
  for (const c of cases) {
    let line;
    try {
      line = JSON.stringify(__cdRunCase(c));
    } catch (e) {
      line = JSON.stringify({ success: false, output: null, error: "EncodeError: " + e.message, execution_time: null });
    }
    process.stdout.write(line + "\n");
  }
}

__cdMain();
"#;

const LIST_NODE: &str = r#"function ListNode(val, next) {
  this.val = val === undefined ? 0 : val;
  this.next = next === undefined ? null : next;
}"#;

const TREE_NODE: &str = r#"function TreeNode(val, left, right) {
  this.val = val === undefined ? 0 : val;
  this.left = left === undefined ? null : left;
  this.right = right === undefined ? null : right;
}"#;

pub struct JavaScriptHarness {
    templates: Handlebars<'static>,
}

impl JavaScriptHarness {
    pub fn new() -> Result<Self> {
        Ok(Self {
            templates: skeleton("javascript", TEMPLATE)?,
        })
    }

    fn decoder(ty: ParamType) -> String {
        match ty {
            ParamType::Int | ParamType::Long => "__cdInt".to_string(),
            ParamType::Double => "__cdNumber".to_string(),
            ParamType::Bool => "__cdBool".to_string(),
            ParamType::Str | ParamType::Void => "__cdStr".to_string(),
            ParamType::CharArray => "__cdList(__cdChar)".to_string(),
            ParamType::ListNode => "__cdListNode".to_string(),
            ParamType::TreeNode => "__cdTreeNode".to_string(),
            seq => match seq.element() {
                Some(elem) => format!("__cdList({})", Self::decoder(elem)),
                None => "__cdStr".to_string(),
            },
        }
    }

    fn encoder(ty: ParamType, var: &str) -> String {
        match ty {
            ParamType::ListNode => format!("__cdEncodeListNode({})", var),
            ParamType::TreeNode => format!("__cdEncodeTreeNode({})", var),
            ParamType::ListNodeArray => format!("{}.map(__cdEncodeListNode)", var),
            _ => var.to_string(),
        }
    }
}

impl HarnessGenerator for JavaScriptHarness {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn string_literal(&self, raw: &str) -> String {
        json_string_literal(raw)
    }

    fn generate(&self, request: &HarnessRequest<'_>) -> Result<String> {
        request.validate()?;
        let signature = request.signature;
        let patterns = scan::patterns()?;
        // Declarations inside comments don't count
        let visible = scan::scan_c_family(request.user_code).blanked;

        let mut type_defs = Vec::new();
        if signature.needs_list_node() && !patterns.js_list_node.is_match(&visible) {
            type_defs.push(LIST_NODE);
        }
        if signature.needs_tree_node() && !patterns.js_tree_node.is_match(&visible) {
            type_defs.push(TREE_NODE);
        }

        let decode = signature
            .params
            .iter()
            .map(|p| {
                let name = self.string_literal(&p.name);
                format!(
                    "const {} = {}(__cdField(__cdArgs, {}), {});",
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
        let (invoke, output_var) = match &signature.output_param {
            Some(param) => (format!("__cdFn({});", args), param.clone()),
            None => (format!("const __cdResult = __cdFn({});", args), "__cdResult".to_string()),
        };

        let data = json!({
            "type_defs": type_defs.join("\n\n"),
            "user_code": request.user_code,
            "embedded_cases": embedded_literals(self, request.cases.embedded(), "  ", ",\n")?,
            "function_name": request.function_name,
            "decode": indent(&decode, "    "),
            "invoke": indent(&invoke, "    "),
            "encode": Self::encoder(signature.output_type(), &output_var),
        });
        Ok(self.templates.render("javascript", &data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::CaseSource;
    use crate::registry::{Param, Signature};

    fn signature(params: Vec<(&str, ParamType)>, returns: ParamType) -> Signature {
        Signature {
            params: params
                .into_iter()
                .map(|(name, ty)| Param { name: name.to_string(), ty })
                .collect(),
            returns,
            output_param: None,
        }
    }

    #[test]
    fn test_generates_calls_for_free_function() {
        let generator = JavaScriptHarness::new().unwrap();
        let sig = signature(vec![("s", ParamType::Str)], ParamType::Bool);
        let source = generator
            .generate(&HarnessRequest {
                user_code: "function isPalindrome(s) { return s === s.split('').reverse().join(''); }",
                function_name: "isPalindrome",
                signature: &sig,
                cases: CaseSource::Argv,
            })
            .unwrap();
        assert!(source.contains(r#"const s = __cdStr(__cdField(__cdArgs, "s"), "s");"#));
        assert!(source.contains("const __cdResult = __cdFn(s);"));
        assert!(source.contains("typeof isPalindrome === \"function\""));
        assert!(source.contains("process.argv[2]"));
    }

    #[test]
    fn test_user_code_keeps_sloppy_mode() {
        let generator = JavaScriptHarness::new().unwrap();
        let sig = signature(vec![("nums", ParamType::IntArray)], ParamType::Int);
        let code = "function missingNumber(nums) {\n  total = nums.length;\n  for (i = 0; i < nums.length; i++) total += i - nums[i];\n  return total;\n}";
        let source = generator
            .generate(&HarnessRequest {
                user_code: code,
                function_name: "missingNumber",
                signature: &sig,
                cases: CaseSource::Argv,
            })
            .unwrap();
        assert!(source.contains(code));
        // Implicit globals only work outside strict mode
        assert!(!source.contains("use strict"));
    }

    #[test]
    fn test_commented_node_declaration_does_not_suppress_injection() {
        let generator = JavaScriptHarness::new().unwrap();
        let sig = signature(vec![("root", ParamType::TreeNode)], ParamType::Int);
        let request = HarnessRequest {
            user_code: "/**\n * function TreeNode(val, left, right) {...}\n */\nvar maxDepth = function(root) { return 0; };",
            function_name: "maxDepth",
            signature: &sig,
            cases: CaseSource::Argv,
        };
        let source = generator.generate(&request).unwrap();
        assert!(source.contains("function TreeNode(val, left, right) {\n  this.val"));
        assert!(!source.contains("function ListNode("));

        let declared = "class TreeNode { constructor(val, left, right) { this.val = val; this.left = left || null; this.right = right || null; } }\nvar maxDepth = function(root) { return 0; };";
        let source = generator
            .generate(&HarnessRequest { user_code: declared, ..request })
            .unwrap();
        assert!(!source.contains("function TreeNode(val, left, right) {\n  this.val"));
    }

    #[test]
    fn test_embedded_cases_are_literals() {
        let generator = JavaScriptHarness::new().unwrap();
        let sig = signature(vec![("nums", ParamType::IntArray)], ParamType::Int);
        let cases = vec![json!({"nums": [3, 0, 1]}).as_object().cloned().unwrap()];
        let source = generator
            .generate(&HarnessRequest {
                user_code: "function missingNumber(nums) { return 2; }",
                function_name: "missingNumber",
                signature: &sig,
                cases: CaseSource::Embedded(&cases),
            })
            .unwrap();
        assert!(source.contains("const __CD_CASES = [\n  \"{\\\"nums\\\":[3,0,1]}\"\n];"));
        assert!(source.contains("__cdList(__cdInt)"));
    }
}
