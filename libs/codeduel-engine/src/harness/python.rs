// Python harness: module-level driver around the user's function or Solution class
use super::{embedded_literals, indent, json_string_literal, scan, skeleton, HarnessGenerator, HarnessRequest};
use crate::error::Result;
use crate::registry::ParamType;
use codeduel_common::types::Language;
use handlebars::Handlebars;
use serde_json::json;

const TEMPLATE: &str = r#"import json as _cd_json
import sys as _cd_sys
import time as _cd_time
import collections as _cd_collections
import math
import heapq
import bisect
import itertools
import functools
import collections
from typing import *
from collections import *

{{{type_defs}}}

{{{user_code}}}


class _CdDecodeError(Exception):
    pass


_CD_CASES = [
{{{embedded_cases}}}
]


def _cd_field(args, name):
    if name not in args:
        raise _CdDecodeError("missing required field '%s'" % name)
    return args[name]


def _cd_expect(ok, name, what):
    if not ok:
        raise _CdDecodeError("field '%s' must be %s" % (name, what))


def _cd_int(v, name):
    _cd_expect(isinstance(v, int) and not isinstance(v, bool), name, "an integer")
    return v


def _cd_float(v, name):
    _cd_expect(isinstance(v, (int, float)) and not isinstance(v, bool), name, "a number")
    return float(v)


def _cd_bool(v, name):
    _cd_expect(isinstance(v, bool), name, "a boolean")
    return v


def _cd_str(v, name):
    _cd_expect(isinstance(v, str), name, "a string")
    return v


def _cd_char(v, name):
    _cd_expect(isinstance(v, str) and len(v) == 1, name, "a single character")
    return v


def _cd_list(item):
    def decode(v, name):
        _cd_expect(isinstance(v, list), name, "an array")
        return [item(x, name) for x in v]
    return decode


def _cd_list_node(v, name):
    head = None
    for x in reversed(_cd_list(_cd_int)(v, name)):
        head = ListNode(x, head)
    return head


def _cd_tree_node(v, name):
    _cd_expect(isinstance(v, list), name, "a level-order array")
    if not v or v[0] is None:
        return None
    root = TreeNode(_cd_int(v[0], name))
    queue = _cd_collections.deque([root])
    i = 1
    while queue and i < len(v):
        node = queue.popleft()
        if i < len(v) and v[i] is not None:
            node.left = TreeNode(_cd_int(v[i], name))
            queue.append(node.left)
        i += 1
        if i < len(v) and v[i] is not None:
            node.right = TreeNode(_cd_int(v[i], name))
            queue.append(node.right)
        i += 1
    return root


def _cd_encode_list_node(head):
    out = []
    while head is not None:
        out.append(head.val)
        head = head.next
        if len(out) > 100000:
            raise ValueError("linked list is cyclic or too long")
    return out


def _cd_encode_tree_node(root):
    out = []
    queue = _cd_collections.deque([root] if root is not None else [])
    while queue:
        node = queue.popleft()
        if node is None:
            out.append(None)
            continue
        out.append(node.val)
        queue.append(node.left)
        queue.append(node.right)
    while out and out[-1] is None:
        out.pop()
    return out


def _cd_target():
    solution = globals().get("Solution")
    if isinstance(solution, type) and hasattr(solution, "{{function_name}}"):
        return getattr(solution(), "{{function_name}}")
    func = globals().get("{{function_name}}")
    if callable(func):
        return func
    raise NameError("function '{{function_name}}' is not defined")


def _cd_run_case(raw):
    started = _cd_time.perf_counter()
    try:
        _cd_args = _cd_json.loads(raw) if isinstance(raw, str) else raw
        if not isinstance(_cd_args, dict):
            raise _CdDecodeError("test input must be a JSON object")
{{{decode}}}
        _cd_fn = _cd_target()
        started = _cd_time.perf_counter()
{{{invoke}}}
        elapsed = (_cd_time.perf_counter() - started) * 1000.0
        return {"success": True, "output": {{{encode}}}, "error": None, "execution_time": elapsed}
    except _CdDecodeError as e:
        return {"success": False, "output": None, "error": "DecodeError: %s" % e, "execution_time": None}
    except Exception as e:
        elapsed = (_cd_time.perf_counter() - started) * 1000.0
        return {"success": False, "output": None, "error": "%s: %s" % (type(e).__name__, e), "execution_time": elapsed}


def _cd_main():
    cases = _cd_json.loads(_cd_sys.argv[1]) if len(_cd_sys.argv) > 1 else _CD_CASES
    for case in cases:
        try:
            line = _cd_json.dumps(_cd_run_case(case))
        except (TypeError, ValueError) as e:
            line = _cd_json.dumps({"success": False, "output": None, "error": "EncodeError: %s" % e, "execution_time": None})
        _cd_sys.stdout.write(line + "\n")
        _cd_sys.stdout.flush()


_cd_main()
"#;

const LIST_NODE: &str = r#"class ListNode:
    def __init__(self, val=0, next=None):
        self.val = val
        self.next = next
"#;

const TREE_NODE: &str = r#"class TreeNode:
    def __init__(self, val=0, left=None, right=None):
        self.val = val
        self.left = left
        self.right = right
"#;

pub struct PythonHarness {
    templates: Handlebars<'static>,
}

impl PythonHarness {
    pub fn new() -> Result<Self> {
        Ok(Self {
            templates: skeleton("python", TEMPLATE)?,
        })
    }

    /// Decoder function expression for a type
    fn decoder(ty: ParamType) -> String {
        match ty {
            ParamType::Int | ParamType::Long => "_cd_int".to_string(),
            ParamType::Double => "_cd_float".to_string(),
            ParamType::Bool => "_cd_bool".to_string(),
            ParamType::Str => "_cd_str".to_string(),
            ParamType::CharArray => "_cd_list(_cd_char)".to_string(),
            ParamType::ListNode => "_cd_list_node".to_string(),
            ParamType::TreeNode => "_cd_tree_node".to_string(),
            ParamType::Void => "_cd_str".to_string(),
            seq => match seq.element() {
                Some(elem) => format!("_cd_list({})", Self::decoder(elem)),
                None => "_cd_str".to_string(),
            },
        }
    }

    fn encoder(ty: ParamType, var: &str) -> String {
        match ty {
            ParamType::ListNode => format!("_cd_encode_list_node({})", var),
            ParamType::TreeNode => format!("_cd_encode_tree_node({})", var),
            ParamType::ListNodeArray => format!("[_cd_encode_list_node(x) for x in {}]", var),
            _ => var.to_string(),
        }
    }

    /// Neutralize the user's script entry point so importing the module runs nothing
    fn neutralize(code: &str) -> Result<String> {
        let patterns = scan::patterns()?;
        Ok(patterns.py_main_guard.replace_all(code, "if False:").into_owned())
    }
}

impl HarnessGenerator for PythonHarness {
    fn language(&self) -> Language {
        Language::Python
    }

    fn string_literal(&self, raw: &str) -> String {
        json_string_literal(raw)
    }

    fn generate(&self, request: &HarnessRequest<'_>) -> Result<String> {
        request.validate()?;
        let signature = request.signature;
        let patterns = scan::patterns()?;

        let mut type_defs = Vec::new();
        if signature.needs_list_node() && !patterns.py_list_node.is_match(request.user_code) {
            type_defs.push(LIST_NODE);
        }
        if signature.needs_tree_node() && !patterns.py_tree_node.is_match(request.user_code) {
            type_defs.push(TREE_NODE);
        }

        let decode = signature
            .params
            .iter()
            .map(|p| {
                let name = self.string_literal(&p.name);
                format!(
                    "{} = {}(_cd_field(_cd_args, {}), {})",
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
            Some(param) => (format!("_cd_fn({})", args), param.clone()),
            None => (format!("_cd_result = _cd_fn({})", args), "_cd_result".to_string()),
        };

        let data = json!({
            "type_defs": type_defs.join("\n\n"),
            "user_code": Self::neutralize(request.user_code)?,
            "embedded_cases": embedded_literals(self, request.cases.embedded(), "    ", ",\n")?,
            "function_name": request.function_name,
            "decode": indent(&decode, "        "),
            "invoke": indent(&invoke, "        "),
            "encode": Self::encoder(signature.output_type(), &output_var),
        });
        Ok(self.templates.render("python", &data)?)
    }
}
