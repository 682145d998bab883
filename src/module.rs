// File: src/module.rs
//
// Module resolution, caching, and filtered import. Reading
// source files from disk and compiling them is out of scope (the crate has
// no front end); what's in scope is the path-to-file resolution rule, the
// module cache keyed by path string, and the `show`/`hide` filter semantics.
// Grounded on the teacher's `module.rs` `ModuleLoader` (cache + circular
// import detection via a loading stack), generalized to the spec's bytecode
// world: a loaded module is an environment plus the bytecode that produced
// it, not an AST.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bytecode::BytecodeChunk;
use crate::environment::EnvRef;
use crate::errors::{ErrorKind, RuntimeError, SourceLocation};
use crate::registry::FunctionRegistry;

/// A loaded module: its environment (bindings visible after running its
/// bytecode) plus the bytecode itself, kept around for introspection.
/// `visible_names` is the result of applying the importer's `show`/`hide`
/// filter once at import time; `GetProperty` consults it rather than
/// re-deriving the filter on every property access. `bytecode` is
/// `Arc`-wrapped so a `Call` into a module function can swap the interpreter's
/// active chunk cheaply instead of cloning the module's whole instruction
/// stream; `functions` is the module's own `FunctionRegistry` snapshot, since
/// a module-qualified call resolves addresses against the module's bytecode,
/// not the importer's.
#[derive(Debug)]
pub struct ModuleValue {
    pub name: String,
    pub environment: EnvRef,
    pub bytecode: Arc<BytecodeChunk>,
    pub functions: FunctionRegistry,
    pub visible_names: Vec<String>,
}

pub struct ModuleLoader {
    /// Keyed by the path string as written in `ImportModule`, not the
    /// resolved filesystem path.
    cache: HashMap<String, std::sync::Arc<ModuleValue>>,
    loading_stack: Vec<String>,
    extension: &'static str,
}

impl ModuleLoader {
    pub fn new() -> Self {
        ModuleLoader { cache: HashMap::new(), loading_stack: Vec::new(), extension: "rl" }
    }

    /// `a.b.c` -> `a/b/c.rl`.
    pub fn resolve_path(&self, dotted: &str) -> PathBuf {
        let parts: Vec<&str> = dotted.split('.').collect();
        let mut path = PathBuf::new();
        for (i, part) in parts.iter().enumerate() {
            if i + 1 == parts.len() {
                path.push(format!("{part}.{}", self.extension));
            } else {
                path.push(part);
            }
        }
        path
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.cache.contains_key(path)
    }

    pub fn get_cached(&self, path: &str) -> Option<std::sync::Arc<ModuleValue>> {
        self.cache.get(path).cloned()
    }

    pub fn begin_loading(&mut self, path: &str) -> Result<(), RuntimeError> {
        if self.loading_stack.iter().any(|p| p == path) {
            return Err(RuntimeError::new(
                ErrorKind::ImportFailure,
                format!("circular import detected: {path}"),
                SourceLocation::unknown(),
            ));
        }
        self.loading_stack.push(path.to_string());
        Ok(())
    }

    /// Releases a path claimed by `begin_loading` without caching anything,
    /// for when loading fails partway through — otherwise the path would sit
    /// on the loading stack forever and every later import of it would be
    /// misreported as circular.
    pub fn abandon_loading(&mut self, path: &str) {
        self.loading_stack.retain(|p| p != path);
    }

    pub fn finish_loading(&mut self, path: &str, module: ModuleValue) -> std::sync::Arc<ModuleValue> {
        self.loading_stack.retain(|p| p != path);
        let rc = std::sync::Arc::new(module);
        self.cache.insert(path.to_string(), rc.clone());
        rc
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a `show`/`hide` filter to the set of names a module exposes.
/// `show` errors if any listed name is missing; `hide` silently ignores a
/// missing hidden name.
pub fn apply_filter(
    all_names: &[String],
    show: Option<&[String]>,
    hide: Option<&[String]>,
) -> Result<Vec<String>, RuntimeError> {
    if let Some(show) = show {
        for name in show {
            if !all_names.iter().any(|n| n == name) {
                return Err(RuntimeError::new(
                    ErrorKind::ImportFailure,
                    format!("module does not export '{name}'"),
                    SourceLocation::unknown(),
                ));
            }
        }
        return Ok(show.to_vec());
    }
    if let Some(hide) = hide {
        return Ok(all_names.iter().filter(|n| !hide.contains(n)).cloned().collect());
    }
    Ok(all_names.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_converts_dots_to_slashes() {
        let loader = ModuleLoader::new();
        assert_eq!(loader.resolve_path("a.b.c"), PathBuf::from("a/b/c.rl"));
    }

    #[test]
    fn show_filter_errors_on_missing_name() {
        let all = vec!["a".to_string(), "b".to_string()];
        let result = apply_filter(&all, Some(&["a".to_string(), "c".to_string()]), None);
        assert!(result.is_err());
    }

    #[test]
    fn hide_filter_silently_ignores_missing_name() {
        let all = vec!["a".to_string(), "b".to_string()];
        let result = apply_filter(&all, None, Some(&["c".to_string()])).unwrap();
        assert_eq!(result, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn show_and_hide_agree_on_observable_surface() {
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let shown = apply_filter(&all, Some(&["a".to_string(), "b".to_string()]), None).unwrap();
        let hidden = apply_filter(&all, None, Some(&["c".to_string()])).unwrap();
        assert_eq!(shown, hidden);
    }

    #[test]
    fn circular_import_is_detected() {
        let mut loader = ModuleLoader::new();
        loader.begin_loading("a/b.rl").unwrap();
        assert!(loader.begin_loading("a/b.rl").is_err());
    }
}
