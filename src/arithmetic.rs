// File: src/arithmetic.rs
//
// Numeric promotion, arithmetic, and comparison for the Strand VM (spec
// §4.1). Pulled out of the dispatch loop into its own module the way the
// teacher keeps numeric coercion out of `vm.rs`'s match arms and in small
// free functions it calls into — `interpreter.rs` stays a dispatch table,
// not a arithmetic textbook.
//
// Structural failures here (division by zero, overflow, a type mismatch)
// are not Rust errors: they become `ErrorUnion` values pushed back onto the
// stack, — "it does not raise from the opcode handler."
// `UndefinedVariable`-class mistakes are the only fatal path, and those
// live in `interpreter.rs`, not here.
//
// Overflow is checked against the operands' *declared* width, not against
// `i64`/`u64`'s native range: a `Value::Int(n, IntWidth::I8)` overflows at
// 127, the same boundary the original implementation's
// `fits_in_current_type` enforces for `TYPE_I8`, well before `i64` would
// ever notice. Each checked op computes in a wider intermediate (`i128`/
// `u128`) and then asks the combined width (the wider of the two operands')
// whether the exact result fits.

use crate::value::{ErrorUnion, ErrorValue, IntWidth, UIntWidth, Value};

/// The result of a binary arithmetic/comparison opcode: either a plain
/// value (the common case) or an error-union wrapping a structural failure
/// the calling bytecode is expected to `CheckError`/`PropagateError` around.
pub enum OpResult {
    Value(Value),
    Error(ErrorValue),
}

impl OpResult {
    pub fn into_value(self) -> Value {
        match self {
            OpResult::Value(v) => v,
            OpResult::Error(e) => Value::ErrorUnion(Box::new(ErrorUnion::err(e))),
        }
    }
}

fn type_error(op: &str, a: &Value, b: &Value) -> OpResult {
    OpResult::Error(ErrorValue::new(
        "TypeError",
        format!("unsupported operand types for {op}: '{}' and '{}'", a.type_name(), b.type_name()),
    ))
}

enum Promoted {
    Int(i64, i64, IntWidth),
    UInt(u64, u64, UIntWidth),
    Float(f64, f64),
}

/// Promotes `a` and `b`: any float operand promotes both to
/// float; otherwise both promote to integer, preferring unsigned when an
/// unsigned operand is present (this crate's `Value` has one integer rank
/// per signedness, so "widest rank" promotion collapses to that rule). The
/// combined integer width is the wider of the two operands' declared
/// widths, independent of this int-vs-uint-vs-float rule.
fn promote(a: &Value, b: &Value) -> Option<Promoted> {
    match (a, b) {
        (Value::Float(..), _) | (_, Value::Float(..)) => Some(Promoted::Float(as_f64(a)?, as_f64(b)?)),
        (Value::UInt(_, wa), _) | (_, Value::UInt(_, wa)) => {
            let width = match (a, b) {
                (Value::UInt(_, w1), Value::UInt(_, w2)) => w1.widest(*w2),
                _ => *wa,
            };
            Some(Promoted::UInt(as_u64(a)?, as_u64(b)?, width))
        }
        (Value::Int(x, wx), Value::Int(y, wy)) => Some(Promoted::Int(*x, *y, wx.widest(*wy))),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n, _) => Some(*n as f64),
        Value::UInt(n, _) => Some(*n as f64),
        Value::Float(n, _) => Some(*n),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Int(n, _) => Some(*n as u64),
        Value::UInt(n, _) => Some(*n),
        Value::Float(n, _) => Some(*n as u64),
        _ => None,
    }
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Int(..) | Value::UInt(..) | Value::Float(..))
}

/// Checked signed addition/subtraction/multiplication against a declared
/// width: the exact result is computed in `i128`, then rejected unless the
/// width's own bounds (not `i64`'s) accept it.
fn int_checked(x: i64, y: i64, width: IntWidth, op: impl Fn(i128, i128) -> i128) -> Option<Value> {
    let result = op(x as i128, y as i128);
    if width.fits(result) {
        Some(Value::Int(result as i64, width))
    } else {
        None
    }
}

/// Checked unsigned addition/subtraction/multiplication against a declared
/// width, computed in `u128`. Subtraction going negative is an overflow
/// here too (there is no unsigned-wraparound allowance in the spec).
fn uint_checked(x: u64, y: u64, width: UIntWidth, op: impl Fn(i128, i128) -> i128) -> Option<Value> {
    let result = op(x as i128, y as i128);
    if result < 0 {
        return None;
    }
    if width.fits(result as u128) {
        Some(Value::UInt(result as u64, width))
    } else {
        None
    }
}

/// Detects the atomic fast path: an `Atomic` left
/// operand performs the lock-free equivalent and returns the resulting
/// value rather than going through ordinary promotion.
fn atomic_delta(cell: &crate::value::AtomicCell, rhs: &Value, negate: bool) -> Option<Value> {
    let delta = match rhs {
        Value::Int(n, _) => *n,
        Value::UInt(n, _) => *n as i64,
        _ => return None,
    };
    let delta = if negate { -delta } else { delta };
    let pre = cell.fetch_add(delta);
    Some(Value::int(pre + delta))
}

pub fn add(a: Value, b: Value) -> OpResult {
    if let Value::Atomic(cell) = &a {
        if let Some(v) = atomic_delta(cell, &b, false) {
            return OpResult::Value(v);
        }
    }
    match (&a, &b) {
        (Value::Str(x), _) => OpResult::Value(Value::str(format!("{x}{}", b.to_display_string()))),
        (_, Value::Str(y)) => OpResult::Value(Value::str(format!("{}{y}", a.to_display_string()))),
        (Value::List(x), Value::List(y)) => {
            let mut out = x.lock().unwrap().clone();
            out.extend(y.lock().unwrap().iter().cloned());
            OpResult::Value(Value::list(out))
        }
        _ if is_numeric(&a) && is_numeric(&b) => match promote(&a, &b) {
            Some(Promoted::Float(x, y)) => OpResult::Value(Value::float(x + y)),
            Some(Promoted::UInt(x, y, w)) => match uint_checked(x, y, w, |x, y| x + y) {
                Some(v) => OpResult::Value(v),
                None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in addition")),
            },
            Some(Promoted::Int(x, y, w)) => match int_checked(x, y, w, |x, y| x + y) {
                Some(v) => OpResult::Value(v),
                None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in addition")),
            },
            None => type_error("+", &a, &b),
        },
        _ => type_error("+", &a, &b),
    }
}

pub fn sub(a: Value, b: Value) -> OpResult {
    if let Value::Atomic(cell) = &a {
        if let Some(v) = atomic_delta(cell, &b, true) {
            return OpResult::Value(v);
        }
    }
    match promote(&a, &b) {
        Some(Promoted::Float(x, y)) => OpResult::Value(Value::float(x - y)),
        Some(Promoted::UInt(x, y, w)) => match uint_checked(x, y, w, |x, y| x - y) {
            Some(v) => OpResult::Value(v),
            None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in subtraction")),
        },
        Some(Promoted::Int(x, y, w)) => match int_checked(x, y, w, |x, y| x - y) {
            Some(v) => OpResult::Value(v),
            None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in subtraction")),
        },
        None => type_error("-", &a, &b),
    }
}

pub fn mul(a: Value, b: Value) -> OpResult {
    match (&a, &b) {
        (Value::Str(s), Value::Int(n, _)) | (Value::Int(n, _), Value::Str(s)) => {
            if *n < 0 {
                OpResult::Error(ErrorValue::new("TypeError", "cannot repeat a string a negative number of times"))
            } else {
                OpResult::Value(Value::str(s.repeat(*n as usize)))
            }
        }
        _ if is_numeric(&a) && is_numeric(&b) => match promote(&a, &b) {
            Some(Promoted::Float(x, y)) => OpResult::Value(Value::float(x * y)),
            Some(Promoted::UInt(x, y, w)) => match uint_checked(x, y, w, |x, y| x * y) {
                Some(v) => OpResult::Value(v),
                None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in multiplication")),
            },
            Some(Promoted::Int(x, y, w)) => match int_checked(x, y, w, |x, y| x * y) {
                Some(v) => OpResult::Value(v),
                None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in multiplication")),
            },
            None => type_error("*", &a, &b),
        },
        _ => type_error("*", &a, &b),
    }
}

pub fn div(a: Value, b: Value) -> OpResult {
    match promote(&a, &b) {
        Some(Promoted::Float(x, y)) => OpResult::Value(Value::float(x / y)),
        Some(Promoted::UInt(x, y, w)) => {
            if y == 0 {
                OpResult::Error(ErrorValue::new("DivisionByZero", "division by zero"))
            } else {
                OpResult::Value(Value::UInt(x / y, w))
            }
        }
        Some(Promoted::Int(x, y, w)) => {
            if y == 0 {
                OpResult::Error(ErrorValue::new("DivisionByZero", "division by zero"))
            } else {
                OpResult::Value(Value::Int(x / y, w))
            }
        }
        None => type_error("/", &a, &b),
    }
}

pub fn modulo(a: Value, b: Value) -> OpResult {
    match promote(&a, &b) {
        Some(Promoted::Float(x, y)) => OpResult::Value(Value::float(x % y)),
        Some(Promoted::UInt(x, y, w)) => {
            if y == 0 {
                OpResult::Error(ErrorValue::new("DivisionByZero", "modulo by zero"))
            } else {
                OpResult::Value(Value::UInt(x % y, w))
            }
        }
        Some(Promoted::Int(x, y, w)) => {
            if y == 0 {
                OpResult::Error(ErrorValue::new("DivisionByZero", "modulo by zero"))
            } else {
                OpResult::Value(Value::Int(x % y, w))
            }
        }
        None => type_error("%", &a, &b),
    }
}

pub fn negate(a: Value) -> OpResult {
    match a {
        Value::Int(n, w) => match int_checked(n, 0, w, |x, _| -x) {
            Some(v) => OpResult::Value(v),
            None => OpResult::Error(ErrorValue::new("ArithmeticError", "integer overflow in negation")),
        },
        Value::Float(n, w) => OpResult::Value(Value::Float(-n, w)),
        Value::UInt(n, _) => OpResult::Value(Value::int(-(n as i64))),
        other => OpResult::Error(ErrorValue::new(
            "TypeError",
            format!("unsupported operand type for unary -: '{}'", other.type_name()),
        )),
    }
}

/// `==`/`!=` never fail: disparate non-numeric types simply compare
/// unequal.
pub fn equal(a: &Value, b: &Value) -> bool {
    Value::values_equal(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Less,
    Equal,
    Greater,
}

/// Ordering comparisons: numeric promotion, lexicographic strings, type
/// error across anything else.
pub fn compare(a: &Value, b: &Value) -> Result<Ordering, ErrorValue> {
    if is_numeric(a) && is_numeric(b) {
        let (x, y) = (as_f64(a).unwrap(), as_f64(b).unwrap());
        return Ok(if x < y {
            Ordering::Less
        } else if x > y {
            Ordering::Greater
        } else {
            Ordering::Equal
        });
    }
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Ok(match x.as_str().cmp(y.as_str()) {
            std::cmp::Ordering::Less => Ordering::Less,
            std::cmp::Ordering::Equal => Ordering::Equal,
            std::cmp::Ordering::Greater => Ordering::Greater,
        });
    }
    Err(ErrorValue::new(
        "TypeError",
        format!("'<' not supported between instances of '{}' and '{}'", a.type_name(), b.type_name()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::IntWidth;

    #[test]
    fn division_by_zero_is_an_error_union_not_a_panic() {
        let result = div(Value::int(10), Value::int(0)).into_value();
        match result {
            Value::ErrorUnion(u) => assert_eq!(u.payload.as_ref().unwrap_err().error_type, "DivisionByZero"),
            other => panic!("expected error union, got {other:?}"),
        }
    }

    #[test]
    fn integer_overflow_is_an_error_union() {
        let result = add(Value::int(i64::MAX), Value::int(1)).into_value();
        match result {
            Value::ErrorUnion(u) => assert_eq!(u.payload.as_ref().unwrap_err().error_type, "ArithmeticError"),
            other => panic!("expected error union, got {other:?}"),
        }
    }

    /// Comment 1's contract: a narrower declared width must overflow at its
    /// *own* boundary, not at `i64`'s — `i8::MAX + 1` is 128, nowhere near
    /// `i64::MAX`, yet must still be rejected.
    #[test]
    fn narrower_declared_width_overflows_before_64_bit_boundary() {
        let result = add(Value::Int(i8::MAX as i64, IntWidth::I8), Value::Int(1, IntWidth::I8)).into_value();
        match result {
            Value::ErrorUnion(u) => assert_eq!(u.payload.as_ref().unwrap_err().error_type, "ArithmeticError"),
            other => panic!("expected error union, got {other:?}"),
        }
    }

    /// The same 64-bit-boundary-distant value is fine at a wider width: this
    /// is the control case proving the narrow-width test above is actually
    /// exercising the width bound, not some unrelated off-by-one.
    #[test]
    fn same_value_is_fine_at_a_wider_declared_width() {
        let result = add(Value::Int(i8::MAX as i64, IntWidth::I32), Value::Int(1, IntWidth::I32)).into_value();
        match result {
            Value::Int(n, IntWidth::I32) => assert_eq!(n, 128),
            other => panic!("expected Int(128, I32), got {other:?}"),
        }
    }

    /// Combining two different declared widths promotes to the wider one —
    /// so `i8::MAX + 1` stops overflowing once one operand is declared
    /// `i32`, the same "widest wins" rule the original's promotion uses.
    #[test]
    fn mixed_width_operands_promote_to_the_wider_one() {
        let result = add(Value::Int(i8::MAX as i64, IntWidth::I8), Value::Int(1, IntWidth::I32)).into_value();
        match result {
            Value::Int(n, IntWidth::I32) => assert_eq!(n, 128),
            other => panic!("expected Int(128, I32), got {other:?}"),
        }
    }

    #[test]
    fn string_plus_anything_concatenates() {
        let result = add(Value::str("x="), Value::int(5)).into_value();
        match result {
            Value::Str(s) => assert_eq!(s.as_str(), "x=5"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn string_times_negative_count_is_a_type_error() {
        let result = mul(Value::str("a"), Value::int(-1)).into_value();
        match result {
            Value::ErrorUnion(u) => assert_eq!(u.payload.as_ref().unwrap_err().error_type, "TypeError"),
            other => panic!("expected error union, got {other:?}"),
        }
    }

    #[test]
    fn float_operand_promotes_both_sides() {
        let result = add(Value::int(1), Value::float(2.5)).into_value();
        match result {
            Value::Float(n, _) => assert!((n - 3.5).abs() < f64::EPSILON),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn ordering_across_disparate_types_is_an_error() {
        assert!(compare(&Value::int(1), &Value::str("x")).is_err());
    }

    #[test]
    fn nil_equals_nil_via_equal() {
        assert!(equal(&Value::Nil, &Value::Nil));
    }

    #[test]
    fn atomic_add_mutates_the_cell_and_returns_the_summed_value() {
        use crate::value::AtomicCell;
        use std::sync::Arc;
        let cell = Arc::new(AtomicCell::new(10));
        let result = add(Value::Atomic(cell.clone()), Value::int(5)).into_value();
        match result {
            Value::Int(n, _) => assert_eq!(n, 15),
            other => panic!("expected Int(15), got {other:?}"),
        }
        assert_eq!(cell.load(), 15);
    }
}
