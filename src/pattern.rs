// File: src/pattern.rs
//
// Pattern matching support. `MatchPattern` pops a pattern and a
// value off the stack and pushes a bool; patterns are encoded on the stack
// as marker values followed by operands. This module holds the `Pattern`
// representation the interpreter builds from those stack operands and the
// matcher itself; binding results are returned so the interpreter can apply
// them to the current environment.
//
// The front end (out of scope) is expected to build a pattern operand as a
// single `Tuple` value before `MatchPattern` runs: `(marker, ...operands)`,
// where `marker` is one of the `__..._pattern__` strings named on `Pattern`'s
// variants below, or `__type_pattern__` for `TypeName`. A bare non-tuple,
// non-nil value is treated as a literal pattern. `pattern_from_value` decodes
// that convention.

use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches a value whose runtime type name equals this string.
    TypeName(String),
    /// `__dict_pattern__`: matches a dict, binds listed field names,
    /// optionally binds the remaining fields under `rest`.
    Dict { fields: Vec<String>, rest: Option<String> },
    /// `__list_pattern__`: matches a list of exactly this length.
    List { names: Vec<String> },
    /// `__tuple_pattern__`: like `List` against a tuple.
    Tuple { names: Vec<String> },
    /// `__val_pattern__`: matches a success error-union, binds the unwrapped
    /// value.
    Val { binding: String },
    /// `__err_pattern__`: matches an error error-union, optionally of a
    /// specific type, binds the error.
    Err { error_type: Option<String>, binding: String },
    /// `__error_type_pattern__`: matches a specific error type, binds its
    /// arguments positionally.
    ErrorType { error_type: String, arg_bindings: Vec<String> },
    /// Equality comparison against a literal value.
    Literal(Value),
    /// Always matches.
    Nil,
}

/// A successful match's bindings, to be installed into the current
/// environment by the caller.
pub type Bindings = Vec<(String, Value)>;

/// Matches `pattern` against `value`. On a non-match, returns `None` with no
/// side effects — the interpreter is responsible for leaving the stack
/// balanced regardless (spec §4.7: "the pattern's stack operands must still
/// be consumed so the evaluation stack remains balanced", which here means
/// the interpreter pops pattern operands before calling this function, not
/// that this function pops anything itself).
pub fn match_pattern(pattern: &Pattern, value: &Value) -> Option<Bindings> {
    match pattern {
        Pattern::Nil => Some(Vec::new()),
        Pattern::TypeName(name) => (value.type_name() == name).then(Vec::new),
        Pattern::Literal(lit) => Value::values_equal(lit, value).then(Vec::new),
        Pattern::Dict { fields, rest } => match value {
            Value::Dict(map) => {
                let map = map.lock().unwrap();
                let mut bindings = Vec::new();
                let mut used = Vec::new();
                for field in fields {
                    let key = Value::str(field.clone());
                    let found = map.iter().find(|(k, _)| Value::values_equal(k, &key))?;
                    bindings.push((field.clone(), found.1.clone()));
                    used.push(field.clone());
                }
                if let Some(rest_name) = rest {
                    let remaining: Vec<(Value, Value)> = map
                        .iter()
                        .filter(|(k, _)| match k {
                            Value::Str(s) => !used.contains(&s.to_string()),
                            _ => true,
                        })
                        .cloned()
                        .collect();
                    bindings.push((rest_name.clone(), Value::dict(remaining)));
                }
                Some(bindings)
            }
            _ => None,
        },
        Pattern::List { names } => match value {
            Value::List(items) => {
                let items = items.lock().unwrap();
                if items.len() != names.len() {
                    return None;
                }
                Some(names.iter().cloned().zip(items.iter().cloned()).collect())
            }
            _ => None,
        },
        Pattern::Tuple { names } => match value {
            Value::Tuple(items) => {
                if items.len() != names.len() {
                    return None;
                }
                Some(names.iter().cloned().zip(items.iter().cloned()).collect())
            }
            _ => None,
        },
        Pattern::Val { binding } => match value {
            Value::ErrorUnion(u) if !u.is_error() => {
                let Ok(inner) = &u.payload else { unreachable!() };
                Some(vec![(binding.clone(), (**inner).clone())])
            }
            _ => None,
        },
        Pattern::Err { error_type, binding } => match value {
            Value::ErrorUnion(u) if u.is_error() => {
                let Err(err) = &u.payload else { unreachable!() };
                if let Some(expected) = error_type {
                    if &err.error_type != expected {
                        return None;
                    }
                }
                Some(vec![(binding.clone(), Value::ErrorUnion(Box::new(crate::value::ErrorUnion::err(err.clone()))))])
            }
            _ => None,
        },
        Pattern::ErrorType { error_type, arg_bindings } => match value {
            Value::ErrorUnion(u) if u.is_error() => {
                let Err(err) = &u.payload else { unreachable!() };
                if &err.error_type != error_type {
                    return None;
                }
                Some(arg_bindings.iter().cloned().zip(err.arguments.iter().cloned()).collect())
            }
            _ => None,
        },
    }
}

/// Decodes a stack-encoded pattern operand into a `Pattern` (see this file's
/// header comment for the tuple-marker convention). Anything that doesn't
/// match a known marker is treated as a literal-equality pattern.
pub fn pattern_from_value(value: &Value) -> Pattern {
    match value {
        Value::Nil => Pattern::Nil,
        Value::Tuple(items) => match items.first() {
            Some(Value::Str(marker)) => match marker.as_str() {
                "__type_pattern__" => Pattern::TypeName(string_at(items.get(1))),
                "__dict_pattern__" => Pattern::Dict {
                    fields: string_list(items.get(1)),
                    rest: optional_string_at(items.get(2)),
                },
                "__list_pattern__" => Pattern::List { names: string_list(items.get(1)) },
                "__tuple_pattern__" => Pattern::Tuple { names: string_list(items.get(1)) },
                "__val_pattern__" => Pattern::Val { binding: string_at(items.get(1)) },
                "__err_pattern__" => Pattern::Err {
                    error_type: optional_string_at(items.get(1)),
                    binding: string_at(items.get(2)),
                },
                "__error_type_pattern__" => Pattern::ErrorType {
                    error_type: string_at(items.get(1)),
                    arg_bindings: string_list(items.get(2)),
                },
                _ => Pattern::Literal(value.clone()),
            },
            _ => Pattern::Literal(value.clone()),
        },
        other => Pattern::Literal(other.clone()),
    }
}

fn string_at(operand: Option<&Value>) -> String {
    match operand {
        Some(Value::Str(s)) => s.to_string(),
        _ => String::new(),
    }
}

fn optional_string_at(operand: Option<&Value>) -> Option<String> {
    match operand {
        Some(Value::Str(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn string_list(operand: Option<&Value>) -> Vec<String> {
    match operand {
        Some(Value::List(items)) => items
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| match v {
                Value::Str(s) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
