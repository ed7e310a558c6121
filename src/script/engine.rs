//! Embedded script engine behind a narrow interface.
//!
//! The core depends on [`Evaluator`] and [`ScriptValue`] only; the rhai
//! engine is an implementation detail of this module. Each device owns one
//! evaluator holding the driver-wide default script, the device's protocol
//! script and every compiled command script.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, Scope, AST};
use tracing::{debug, error, info};

use crate::core::error::{GatewayError, Result};
use crate::script::value::ScriptValue;

/// Host surface exposed to scripts.
///
/// Implemented by the protocol engine; heavy operations are fire-and-forget
/// so a script can never block on cluster I/O.
pub trait ScriptHost: Send + Sync {
    fn device_id(&self) -> String;
    /// Merge a value under the device's `data` subtree in the shared object.
    fn set_data(&self, path: Vec<String>, value: serde_json::Value);
    /// Read from the device's `data` subtree.
    fn get_data(&self, path: Vec<String>) -> serde_json::Value;
    /// Delete a path from the device's `data` subtree.
    fn delete_data(&self, path: Vec<String>);
}

/// A compiled script program: compile sources incrementally, look functions
/// up by name, call them with tagged values.
pub trait Evaluator: Send + Sync {
    /// Compile `source`, run its top-level statements once, and retain its
    /// functions for later calls.
    fn compile(&mut self, source: &str) -> Result<()>;

    /// True when a function of that exact name was compiled.
    fn has_fn(&self, name: &str) -> bool;

    /// Positional parameter count of a compiled function.
    fn fn_arity(&self, name: &str) -> Option<usize>;

    /// Call a compiled function. A script-side `throw` surfaces as
    /// [`GatewayError::Script`].
    fn call(&self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue>;
}

/// rhai-backed [`Evaluator`].
pub struct RhaiEvaluator {
    engine: Engine,
    ast: AST,
    scope: Mutex<Scope<'static>>,
    arities: HashMap<String, usize>,
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        let engine = Self::base_engine(None);
        Self {
            engine,
            ast: AST::empty(),
            scope: Mutex::new(Scope::new()),
            arities: HashMap::new(),
        }
    }

    /// Evaluator wired to a device's host surface.
    pub fn with_host(host: Arc<dyn ScriptHost>) -> Self {
        let engine = Self::base_engine(Some(host));
        Self {
            engine,
            ast: AST::empty(),
            scope: Mutex::new(Scope::new()),
            arities: HashMap::new(),
        }
    }

    fn base_engine(host: Option<Arc<dyn ScriptHost>>) -> Engine {
        let mut engine = Engine::new();

        engine.register_fn("log_info", |msg: &str| info!("(script) {}", msg));
        engine.register_fn("log_debug", |msg: &str| debug!("(script) {}", msg));
        engine.register_fn("log_error", |msg: &str| error!("(script) {}", msg));

        if let Some(host) = host {
            let h = host.clone();
            engine.register_fn("device_id", move || h.device_id());

            let h = host.clone();
            engine.register_fn("set_data", move |key: &str, value: Dynamic| {
                h.set_data(vec![key.to_string()], dynamic_to_value(&value).to_json());
            });
            let h = host.clone();
            engine.register_fn("set_data", move |path: rhai::Array, value: Dynamic| {
                h.set_data(path_strings(&path), dynamic_to_value(&value).to_json());
            });

            let h = host.clone();
            engine.register_fn("get_data", move |key: &str| {
                value_to_dynamic(&ScriptValue::from_json(&h.get_data(vec![key.to_string()])))
            });
            let h = host.clone();
            engine.register_fn("get_data", move |path: rhai::Array| {
                value_to_dynamic(&ScriptValue::from_json(&h.get_data(path_strings(&path))))
            });

            let h = host.clone();
            engine.register_fn("delete_data", move |key: &str| {
                h.delete_data(vec![key.to_string()]);
            });
            let h = host;
            engine.register_fn("delete_data", move |path: rhai::Array| {
                h.delete_data(path_strings(&path));
            });
        }

        engine
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for RhaiEvaluator {
    fn compile(&mut self, source: &str) -> Result<()> {
        if source.trim().is_empty() {
            return Ok(());
        }
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| GatewayError::script(format!("compile failed: {e}")))?;

        {
            // run top-level statements once; globals land in the scope
            let mut scope = self.scope.lock().unwrap();
            self.engine
                .run_ast_with_scope(&mut scope, &ast)
                .map_err(|e| GatewayError::script(format!("script execution failed: {e}")))?;
        }

        for f in ast.iter_functions() {
            self.arities.insert(f.name.to_string(), f.params.len());
        }
        // keep functions only so later calls never replay top-level code
        self.ast += ast.clone_functions_only();
        Ok(())
    }

    fn has_fn(&self, name: &str) -> bool {
        self.arities.contains_key(name)
    }

    fn fn_arity(&self, name: &str) -> Option<usize> {
        self.arities.get(name).copied()
    }

    fn call(&self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        let dyn_args: Vec<Dynamic> = args.iter().map(value_to_dynamic).collect();
        let mut scope = self.scope.lock().unwrap();
        match self
            .engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, name, dyn_args)
        {
            Ok(out) => Ok(dynamic_to_value(&out)),
            Err(e) => Err(GatewayError::script(format!("{name} failed: {e}"))),
        }
    }
}

fn path_strings(path: &rhai::Array) -> Vec<String> {
    path.iter().map(|p| p.to_string()).collect()
}

/// Map an engine value into the tagged representation.
pub fn dynamic_to_value(value: &Dynamic) -> ScriptValue {
    if value.is_unit() {
        ScriptValue::None
    } else if let Some(b) = value.clone().try_cast::<bool>() {
        ScriptValue::Bool(b)
    } else if let Some(i) = value.clone().try_cast::<rhai::INT>() {
        ScriptValue::Int(i)
    } else if let Some(f) = value.clone().try_cast::<rhai::FLOAT>() {
        ScriptValue::Float(f)
    } else if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        ScriptValue::Str(s.to_string())
    } else if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
        ScriptValue::Bytes(blob)
    } else if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        ScriptValue::List(arr.iter().map(dynamic_to_value).collect())
    } else if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        // `#{error: "..."}` alone is the throwable shape
        if map.len() == 1 {
            if let Some(msg) = map.get("error").and_then(|v| v.clone().try_cast::<rhai::ImmutableString>()) {
                return ScriptValue::Throwable(msg.to_string());
            }
        }
        ScriptValue::Dict(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_value(v)))
                .collect(),
        )
    } else {
        ScriptValue::Other(value.type_name().to_string())
    }
}

/// Map a tagged value into the engine representation.
pub fn value_to_dynamic(value: &ScriptValue) -> Dynamic {
    match value {
        ScriptValue::None => Dynamic::UNIT,
        ScriptValue::Str(s) => s.clone().into(),
        ScriptValue::Int(i) => Dynamic::from(*i),
        ScriptValue::Float(f) => Dynamic::from(*f),
        ScriptValue::Bool(b) => Dynamic::from(*b),
        ScriptValue::Bytes(b) => Dynamic::from_blob(b.clone()),
        ScriptValue::List(items) => {
            Dynamic::from_array(items.iter().map(value_to_dynamic).collect())
        }
        ScriptValue::Dict(map) => {
            let mut m = rhai::Map::new();
            for (k, v) in map {
                m.insert(k.clone().into(), value_to_dynamic(v));
            }
            Dynamic::from_map(m)
        }
        ScriptValue::Throwable(msg) => {
            let mut m = rhai::Map::new();
            m.insert("error".into(), msg.clone().into());
            Dynamic::from_map(m)
        }
        ScriptValue::Other(ty) => format!("<{ty}>").into(),
    }
}

/// Rename the first `fn <old>(` definition in `source` to `fn <new>(`.
///
/// Command and protocol functions share one evaluator per device, so their
/// well-known names are suffixed with the owning id before compilation.
pub fn rename_script_fn(source: &str, old: &str, new: &str) -> String {
    let bytes = source.as_bytes();
    let mut i = 0;
    while let Some(pos) = source[i..].find("fn") {
        let start = i + pos;
        i = start + 2;
        // word boundary before "fn"
        if start > 0 {
            let prev = bytes[start - 1];
            if prev.is_ascii_alphanumeric() || prev == b'_' {
                continue;
            }
        }
        let rest = &source[start + 2..];
        let trimmed = rest.trim_start_matches([' ', '\t']);
        let ws = rest.len() - trimmed.len();
        if ws == 0 || !trimmed.starts_with(old) {
            continue;
        }
        let after = &trimmed[old.len()..];
        let after_trimmed = after.trim_start_matches([' ', '\t']);
        if !after_trimmed.starts_with('(') {
            continue;
        }
        let name_start = start + 2 + ws;
        let mut out = String::with_capacity(source.len() + new.len() - old.len());
        out.push_str(&source[..name_start]);
        out.push_str(new);
        out.push_str(&source[name_start + old.len()..]);
        return out;
    }
    source.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_call() {
        let mut eval = RhaiEvaluator::new();
        eval.compile("fn double(x) { x * 2 }").unwrap();
        assert!(eval.has_fn("double"));
        assert_eq!(eval.fn_arity("double"), Some(1));
        let out = eval.call("double", vec![ScriptValue::Int(21)]).unwrap();
        assert_eq!(out, ScriptValue::Int(42));
    }

    #[test]
    fn test_incremental_compiles_accumulate() {
        let mut eval = RhaiEvaluator::new();
        eval.compile("fn a() { 1 }").unwrap();
        eval.compile("fn b() { 2 }").unwrap();
        assert_eq!(eval.call("a", vec![]).unwrap(), ScriptValue::Int(1));
        assert_eq!(eval.call("b", vec![]).unwrap(), ScriptValue::Int(2));
    }

    #[test]
    fn test_thrown_error_is_script_error() {
        let mut eval = RhaiEvaluator::new();
        eval.compile(r#"fn bad() { throw "nope" }"#).unwrap();
        let err = eval.call("bad", vec![]).unwrap_err();
        assert!(err.is_script(), "expected script error, got {err:?}");
    }

    #[test]
    fn test_list_of_tuples_output() {
        let mut eval = RhaiEvaluator::new();
        eval.compile(r#"fn cmd() { [["t1", "1"], ["t2", "2"]] }"#).unwrap();
        match eval.call("cmd", vec![]).unwrap() {
            ScriptValue::List(items) => {
                assert_eq!(items.len(), 2);
                match &items[0] {
                    ScriptValue::List(pair) => {
                        assert_eq!(pair[0], ScriptValue::Str("t1".into()));
                    }
                    other => panic!("expected tuple list, got {other:?}"),
                }
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_throwable_shape() {
        let mut eval = RhaiEvaluator::new();
        eval.compile(r#"fn ctl(list, idx) { #{error: "stop here"} }"#).unwrap();
        let out = eval
            .call("ctl", vec![ScriptValue::List(vec![]), ScriptValue::Int(0)])
            .unwrap();
        assert_eq!(out, ScriptValue::Throwable("stop here".into()));
    }

    #[test]
    fn test_rename_script_fn() {
        let src = "fn cmdFunc(x) { x }\nfn control(list, idx) { () }";
        let out = rename_script_fn(src, "cmdFunc", "cmdFunc_d1");
        assert!(out.contains("fn cmdFunc_d1(x)"));
        assert!(out.contains("fn control(list, idx)"));
        // only the definition is renamed, call sites keep their text
        let src2 = "fn outer() { cmdFunc(1) }\nfn cmdFunc(x) { x }";
        let out2 = rename_script_fn(src2, "cmdFunc", "cmdFunc_z");
        assert!(out2.contains("{ cmdFunc(1) }"));
        assert!(out2.contains("fn cmdFunc_z(x)"));
    }

    #[test]
    fn test_top_level_statements_run_once() {
        let mut eval = RhaiEvaluator::new();
        // compile must not fail on top-level statements
        eval.compile("let seed = 10;\nfn f() { 5 }").unwrap();
        assert_eq!(eval.call("f", vec![]).unwrap(), ScriptValue::Int(5));
    }

    #[test]
    fn test_unknown_function() {
        let eval = RhaiEvaluator::new();
        assert!(!eval.has_fn("missing"));
        assert!(eval.call("missing", vec![]).is_err());
    }
}
