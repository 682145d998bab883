// File: src/natives.rs
//
// Native function registration protocol. Bodies are out of scope
// ("Built-in function bodies" is listed as an external collaborator); this
// module specifies the two registration paths — validated and builtin — and
// ships just enough illustrative natives (`print`, basic math) to exercise
// the protocol end to end, the way the teacher's `builtins.rs` registers a
// small set of math/string helpers directly rather than via a plugin
// system.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::{ErrorValue, Value};

/// `Send + Sync` so a task VM spawned onto a worker thread can still reach
/// the interpreter's native registry — task VMs share the enclosing
/// interpreter's function and native registries rather than owning copies.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, ErrorValue> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Int,
    Float,
    Str,
    Bool,
    List,
}

fn matches_type(expected: &ParamType, value: &Value) -> bool {
    match expected {
        ParamType::Any => true,
        ParamType::Int => matches!(value, Value::Int(..) | Value::UInt(..)),
        ParamType::Float => matches!(value, Value::Float(..)),
        ParamType::Str => matches!(value, Value::Str(_)),
        ParamType::Bool => matches!(value, Value::Bool(_)),
        ParamType::List => matches!(value, Value::List(_)),
    }
}

/// A native registration: either `Validated` (parameter count/type checked
/// before invocation) or `Builtin` (no validation — reserved for the
/// language's own standard library shims, which are trusted to call
/// themselves correctly).
#[derive(Clone)]
pub enum NativeEntry {
    Validated { signature: Vec<ParamType>, func: NativeFn },
    Builtin { func: NativeFn },
}

/// Cloneable so a `parallel`/`concurrent` block can snapshot the registry
/// once per block and hand each task VM its own `Arc`-backed copy rather
/// than sharing a lock across worker threads (native entries themselves
/// are cheap to clone: each is an `Arc<dyn Fn>` plus a small signature).
#[derive(Default, Clone)]
pub struct NativeRegistry {
    entries: HashMap<String, NativeEntry>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry { entries: HashMap::new() }
    }

    pub fn register_validated(&mut self, name: impl Into<String>, signature: Vec<ParamType>, func: NativeFn) {
        self.entries.insert(name.into(), NativeEntry::Validated { signature, func });
    }

    pub fn register_builtin(&mut self, name: impl Into<String>, func: NativeFn) {
        self.entries.insert(name.into(), NativeEntry::Builtin { func });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Invokes the named native. Validated natives are checked against
    /// their signature before the call; builtins are trusted as-is. Errors
    /// thrown by a builtin are returned for the caller to wrap in an
    /// error-union and propagate, *unless* the native's name is `assert`, in
    /// which case the caller must treat it as fatal.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ErrorValue> {
        match self.entries.get(name) {
            Some(NativeEntry::Validated { signature, func }) => {
                if args.len() != signature.len() {
                    return Err(ErrorValue::new(
                        "ArityError",
                        format!("{name} expects {} arguments, got {}", signature.len(), args.len()),
                    ));
                }
                for (expected, actual) in signature.iter().zip(args.iter()) {
                    if !matches_type(expected, actual) {
                        return Err(ErrorValue::new(
                            "TypeError",
                            format!("{name}: argument type mismatch, expected {expected:?}"),
                        ));
                    }
                }
                func(args)
            }
            Some(NativeEntry::Builtin { func }) => func(args),
            None => Err(ErrorValue::new("UndefinedFunction", format!("native function '{name}' is not registered"))),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }
}

/// Registers the small illustrative standard-library slice this crate ships
/// with: `print` (builtin, side-effecting, not part of any language-level
/// "stdout" interface beyond writing to process stdout) and a handful of
/// validated math functions.
pub fn install_default_natives(registry: &mut NativeRegistry) {
    registry.register_builtin(
        "print",
        Arc::new(|args: &[Value]| {
            let rendered: Vec<String> = args.iter().map(Value::to_display_string).collect();
            println!("{}", rendered.join(" "));
            Ok(Value::Nil)
        }),
    );

    registry.register_validated(
        "abs",
        vec![ParamType::Float],
        Arc::new(|args: &[Value]| match &args[0] {
            Value::Float(n, w) => Ok(Value::Float(n.abs(), *w)),
            _ => unreachable!("validated by signature"),
        }),
    );

    registry.register_validated(
        "sqrt",
        vec![ParamType::Float],
        Arc::new(|args: &[Value]| match &args[0] {
            Value::Float(n, w) => Ok(Value::Float(n.sqrt(), *w)),
            _ => unreachable!("validated by signature"),
        }),
    );

    registry.register_validated(
        "range",
        vec![ParamType::Int, ParamType::Int, ParamType::Int],
        Arc::new(|args: &[Value]| {
            let (Value::Int(a, _), Value::Int(b, _), Value::Int(step, _)) = (&args[0], &args[1], &args[2]) else {
                unreachable!("validated by signature")
            };
            if *step <= 0 {
                return Err(ErrorValue::new("ValueError", "range step must be positive"));
            }
            let mut out = Vec::new();
            let mut cur = *a;
            while cur < *b {
                out.push(Value::int(cur));
                cur += step;
            }
            Ok(Value::list(out))
        }),
    );

    registry.register_builtin(
        "assert",
        Arc::new(|args: &[Value]| {
            if args.first().map(Value::is_truthy).unwrap_or(false) {
                Ok(Value::Nil)
            } else {
                let msg = args.get(1).map(Value::to_display_string).unwrap_or_default();
                Err(ErrorValue::new("AssertionError", format!("Assertion failed: {msg}")))
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validated_native_rejects_wrong_arity() {
        let mut registry = NativeRegistry::new();
        install_default_natives(&mut registry);
        let err = registry.call("abs", &[]).unwrap_err();
        assert_eq!(err.error_type, "ArityError");
    }

    #[test]
    fn validated_native_rejects_wrong_type() {
        let mut registry = NativeRegistry::new();
        install_default_natives(&mut registry);
        let err = registry.call("abs", &[Value::str("x")]).unwrap_err();
        assert_eq!(err.error_type, "TypeError");
    }

    #[test]
    fn assert_failure_message_carries_the_fatal_marker() {
        let mut registry = NativeRegistry::new();
        install_default_natives(&mut registry);
        let err = registry.call("assert", &[Value::Bool(false), Value::str("x > 0")]).unwrap_err();
        assert!(err.is_always_fatal());
    }

    #[test]
    fn range_yields_ceil_count_of_values() {
        let mut registry = NativeRegistry::new();
        install_default_natives(&mut registry);
        let result = registry.call("range", &[Value::int(0), Value::int(10), Value::int(3)]).unwrap();
        match result {
            Value::List(items) => assert_eq!(items.lock().unwrap().len(), 4), // 0,3,6,9 = ceil(10/3)
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_native_is_an_undefined_function_error() {
        let registry = NativeRegistry::new();
        let err = registry.call("nope", &[]).unwrap_err();
        assert_eq!(err.error_type, "UndefinedFunction");
    }
}
