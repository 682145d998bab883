// File: src/program.rs
//
// The crate has no front end: it consumes an
// immutable `Instruction` vector and constant pool, not source text. This
// module is the thin loader that lets the binary and the module system
// (§4.4) actually get a `BytecodeChunk` from disk — a JSON encoding of the
// wire format in bytecode.rs, via `serde_json`, matching the teacher's own
// choice to reach for `serde`/`serde_json` rather than hand-roll a decoder.

use std::fs;
use std::path::Path;

use crate::bytecode::BytecodeChunk;

#[derive(Debug)]
pub struct LoadError(pub String);

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LoadError {}

/// Reads and decodes a JSON-encoded `BytecodeChunk` from `path`. Used both
/// by the `run` CLI command and by `ImportExecute` to resolve a
/// module path to its compiled form.
pub fn load_bytecode_file(path: &Path) -> Result<BytecodeChunk, LoadError> {
    let text = fs::read_to_string(path).map_err(|e| LoadError(format!("cannot read {}: {e}", path.display())))?;
    load_bytecode_str(&text)
}

/// Decodes a `BytecodeChunk` from an in-memory JSON string.
pub fn load_bytecode_str(text: &str) -> Result<BytecodeChunk, LoadError> {
    serde_json::from_str(text).map_err(|e| LoadError(format!("malformed bytecode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Instruction, OpCode};
    use crate::value::IntWidth;

    #[test]
    fn round_trips_through_json() {
        let chunk = BytecodeChunk::new(
            vec![Instruction::new(OpCode::LoadConst(0), 1), Instruction::new(OpCode::Halt, 1)],
            vec![Constant::Int(42, IntWidth::I64)],
        );
        let encoded = serde_json::to_string(&chunk).unwrap();
        let decoded = load_bytecode_str(&encoded).unwrap();
        assert_eq!(decoded.instructions.len(), 2);
        assert_eq!(decoded.constants, vec![Constant::Int(42, IntWidth::I64)]);
    }

    #[test]
    fn malformed_json_is_reported_as_a_load_error() {
        let err = load_bytecode_str("{ not json").unwrap_err();
        assert!(err.0.contains("malformed bytecode"));
    }

    #[test]
    fn missing_file_is_reported_as_a_load_error() {
        let err = load_bytecode_file(Path::new("/nonexistent/path/does-not-exist.json")).unwrap_err();
        assert!(err.0.contains("cannot read"));
    }
}
