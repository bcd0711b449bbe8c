//! Sandboxed snippet evaluation for transform steps.
//!
//! Snippets run inside embedded interpreters with no host access: no
//! network, no file system, no ambient imports. A snippet defines one
//! function; it receives the step's resolved input bindings as its only
//! argument and returns one value.

use regex::Regex;
use rquickjs::{Context as JsContext, FromJs, Runtime as JsRuntime};
use rustpython_vm::{
    AsObject, Interpreter, PyObjectRef, VirtualMachine,
    builtins::{PyDict, PyFloat, PyInt, PyList, PyStr},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FlowgateError, Result};

/// Interpreted language a transform snippet targets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Javascript,
    Python3,
}

/// Run a snippet in the declared language with the given input bindings.
pub fn execute(
    language: ScriptLanguage,
    code: &str,
    inputs: Value,
) -> Result<Value> {
    match language {
        ScriptLanguage::Javascript => execute_javascript(code, inputs),
        ScriptLanguage::Python3 => execute_python(code, inputs),
    }
}

/// First declared function name, by language-specific pattern.
fn declared_function(
    code: &str,
    pattern: &str,
) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(code).map(|caps| caps[1].to_string())
}

fn execute_javascript(
    code: &str,
    inputs: Value,
) -> Result<Value> {
    let entry = declared_function(code, r"function\s+([a-zA-Z_][a-zA-Z0-9_]*)\s*\(")
        .ok_or_else(|| FlowgateError::Script("snippet declares no function".to_string()))?;

    let runtime = JsRuntime::new().map_err(|e| FlowgateError::Script(e.to_string()))?;
    let js_ctx = JsContext::full(&runtime).map_err(|e| FlowgateError::Script(e.to_string()))?;

    js_ctx.with(|ctx| {
        if let Err(rquickjs::Error::Exception) = ctx.eval::<(), _>(code) {
            let exception = rquickjs::Exception::from_js(&ctx, ctx.catch()).unwrap();
            return Err(FlowgateError::Script(format!("eval: {}", exception.message().unwrap_or_default())));
        }

        // Call the entry function with the bindings, serializing the result
        // back through JSON so only data crosses the boundary.
        let inputs_json = serde_json::to_string(&inputs).unwrap_or_default();
        let call = format!("JSON.stringify({}({}))", entry, inputs_json);

        let evaluated: std::result::Result<String, _> = ctx.eval(call);
        match evaluated {
            Ok(json_str) => serde_json::from_str(&json_str).map_err(|e| FlowgateError::Script(e.to_string())),
            Err(rquickjs::Error::Exception) => {
                let exception = rquickjs::Exception::from_js(&ctx, ctx.catch()).unwrap();
                Err(FlowgateError::Script(format!("call: {}", exception.message().unwrap_or_default())))
            }
            Err(e) => Err(FlowgateError::Script(e.to_string())),
        }
    })
}

fn execute_python(
    code: &str,
    inputs: Value,
) -> Result<Value> {
    let entry = declared_function(code, r"def\s+([a-zA-Z_][a-zA-Z0-9_]*)\s*\(")
        .ok_or_else(|| FlowgateError::Script("snippet declares no function".to_string()))?;

    // without_stdlib keeps the interpreter import-free: builtins only.
    Interpreter::without_stdlib(Default::default()).enter(|vm| {
        let scope = vm.new_scope_with_builtins();

        let code_obj = vm
            .compile(code, rustpython_vm::compiler::Mode::Exec, "<transform>".to_owned())
            .map_err(|e| FlowgateError::Script(format!("compile: {:?}", e)))?;

        vm.run_code_obj(code_obj, scope.clone()).map_err(|e| FlowgateError::Script(format!("exec: {:?}", e)))?;

        let function = scope.globals.get_item(&entry, vm).map_err(|e| FlowgateError::Script(format!("{:?}", e)))?;

        let bindings = json_to_py(vm, &inputs);
        let result = function.call((bindings,), vm).map_err(|e| FlowgateError::Script(format!("call: {:?}", e)))?;

        py_to_json(vm, &result)
    })
}

fn json_to_py(
    vm: &VirtualMachine,
    value: &Value,
) -> PyObjectRef {
    match value {
        Value::Null => vm.ctx.none(),
        Value::Bool(b) => vm.ctx.new_bool(*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                vm.ctx.new_int(i).into()
            } else if let Some(f) = n.as_f64() {
                vm.ctx.new_float(f).into()
            } else {
                vm.ctx.none()
            }
        }
        Value::String(s) => vm.ctx.new_str(s.as_str()).into(),
        Value::Array(arr) => {
            let items: Vec<PyObjectRef> = arr.iter().map(|v| json_to_py(vm, v)).collect();
            vm.ctx.new_list(items).into()
        }
        Value::Object(obj) => {
            let dict = vm.ctx.new_dict();
            for (k, v) in obj {
                dict.set_item(k.as_str(), json_to_py(vm, v), vm).unwrap();
            }
            dict.into()
        }
    }
}

fn py_to_json(
    vm: &VirtualMachine,
    obj: &PyObjectRef,
) -> Result<Value> {
    if vm.is_none(obj) {
        return Ok(Value::Null);
    }

    // bool subclasses int in Python, so it must be checked first
    if obj.fast_isinstance(vm.ctx.types.bool_type) {
        return Ok(Value::Bool(obj.is(&vm.ctx.true_value)));
    }

    if let Some(i) = obj.payload::<PyInt>() {
        if let Ok(n) = i.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
    }

    if let Some(f) = obj.payload::<PyFloat>() {
        if let Some(n) = serde_json::Number::from_f64(f.to_f64()) {
            return Ok(Value::Number(n));
        }
    }

    if let Some(s) = obj.payload::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }

    if let Some(list) = obj.payload::<PyList>() {
        let mut items = Vec::new();
        for item in list.borrow_vec().iter() {
            items.push(py_to_json(vm, item)?);
        }
        return Ok(Value::Array(items));
    }

    if let Some(dict) = obj.payload::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict {
            let key = k.payload::<PyStr>().map(|s| s.as_str().to_string()).unwrap_or_else(|| format!("{:?}", k));
            map.insert(key, py_to_json(vm, &v)?);
        }
        return Ok(Value::Object(map));
    }

    Ok(Value::String(format!("{:?}", obj)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_declared_function_detection() {
        assert_eq!(
            declared_function("function shape(params) {}", r"function\s+([a-zA-Z_][a-zA-Z0-9_]*)\s*\("),
            Some("shape".to_string())
        );
        assert_eq!(declared_function("const x = 1;", r"function\s+([a-zA-Z_][a-zA-Z0-9_]*)\s*\("), None);
        assert_eq!(
            declared_function("def pick(params): pass", r"def\s+([a-zA-Z_][a-zA-Z0-9_]*)\s*\("),
            Some("pick".to_string())
        );
    }

    #[test]
    fn test_javascript_transform() {
        let code = r#"
        function main({a, b}) {
            return { sum: a + b };
        }
        "#;
        let result = execute(ScriptLanguage::Javascript, code, json!({"a": 2, "b": 40})).unwrap();
        assert_eq!(result, json!({"sum": 42}));
    }

    #[test]
    fn test_javascript_reads_structured_input() {
        let code = r#"
        function pluck({reply}) {
            return { status: reply.status, first: reply.items[0] };
        }
        "#;
        let result = execute(
            ScriptLanguage::Javascript,
            code,
            json!({"reply": {"status": 200, "items": ["x", "y"]}}),
        )
        .unwrap();
        assert_eq!(result, json!({"status": 200, "first": "x"}));
    }

    #[test]
    fn test_javascript_error_is_reported() {
        let code = r#"
        function main(params) {
            throw new Error("nope");
        }
        "#;
        let err = execute(ScriptLanguage::Javascript, code, json!({})).unwrap_err();
        assert!(matches!(err, FlowgateError::Script(_)));
    }

    #[test]
    fn test_python_transform() {
        let code = r#"
def summarize(params):
    values = params["values"]
    return {"total": sum(values), "n": len(values)}
"#;
        let result = execute(ScriptLanguage::Python3, code, json!({"values": [1, 2, 3]})).unwrap();
        assert_eq!(result, json!({"total": 6, "n": 3}));
    }

    #[test]
    fn test_python_bool_round_trip() {
        let code = r#"
def check(params):
    return {"big": params["n"] > 10}
"#;
        let result = execute(ScriptLanguage::Python3, code, json!({"n": 15})).unwrap();
        assert_eq!(result, json!({"big": true}));
    }

    #[test]
    fn test_no_function_rejected() {
        assert!(execute(ScriptLanguage::Javascript, "1 + 1", json!({})).is_err());
        assert!(execute(ScriptLanguage::Python3, "x = 1", json!({})).is_err());
    }
}
