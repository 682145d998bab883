// File: src/environment.rs
//
// Lexically-scoped environments for the Strand VM.
//
// A flat `Vec<HashMap>` stack inside one `Environment` struct is adequate
// for a tree-walking interpreter where nothing outlives the call that
// created it, but not here: a closure must be able to capture a scope and
// keep it alive after the defining call returns, and a `parallel`/
// `concurrent` block can hand that same scope to a task VM running on
// another thread. So here an environment is its own `Arc<Mutex<_>>` node
// with at most one lexical parent and at most one closure parent, forming
// a forest rather than a stack, and `Send + Sync` so it can cross into a
// task VM.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::value::{Value, Visibility};

/// Shared handle to an environment node.
pub type EnvRef = Arc<Mutex<Environment>>;

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    visibility: Visibility,
}

/// One lexical scope: a set of name -> value bindings, a pointer to the
/// enclosing lexical scope, and optionally the environment a closure
/// captured at its creation.
#[derive(Debug)]
pub struct Environment {
    bindings: HashMap<String, Binding>,
    /// Variables captured by a closure that owns this environment. The
    /// current scope's captured-variable table is tried before `bindings`.
    /// Held behind a shared cell rather than an
    /// owned `Value` so that two closures created against the same
    /// enclosing activation can be made to capture the identical cell
    /// (see `capture_cell` below) and observe each other's mutations.
    captured: HashMap<String, Arc<Mutex<Value>>>,
    /// Lazily-created cells for names captured by a closure originating
    /// from *this* environment.
    /// Keyed separately from `captured` — `capture_cells` holds the
    /// capture-time snapshot cells of an activation that is *creating*
    /// closures; `captured` holds the cells a closure's own environment
    /// received from its creator.
    capture_cells: HashMap<String, Arc<Mutex<Value>>>,
    lexical_parent: Option<EnvRef>,
    closure_parent: Option<EnvRef>,
}

impl Environment {
    pub fn new_root() -> EnvRef {
        Arc::new(Mutex::new(Environment {
            bindings: HashMap::new(),
            captured: HashMap::new(),
            capture_cells: HashMap::new(),
            lexical_parent: None,
            closure_parent: None,
        }))
    }

    pub fn new_child(parent: &EnvRef) -> EnvRef {
        Arc::new(Mutex::new(Environment {
            bindings: HashMap::new(),
            captured: HashMap::new(),
            capture_cells: HashMap::new(),
            lexical_parent: Some(Arc::clone(parent)),
            closure_parent: None,
        }))
    }

    /// A fresh environment parented lexically to `parent`, with `closure`
    /// as its closure-parent — what a closure call environment looks like.
    pub fn new_closure_child(parent: &EnvRef, closure: &EnvRef) -> EnvRef {
        Arc::new(Mutex::new(Environment {
            bindings: HashMap::new(),
            captured: HashMap::new(),
            capture_cells: HashMap::new(),
            lexical_parent: Some(Arc::clone(parent)),
            closure_parent: Some(Arc::clone(closure)),
        }))
    }

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.define_with_visibility(name, value, Visibility::Public);
    }

    pub fn define_with_visibility(&mut self, name: impl Into<String>, value: Value, visibility: Visibility) {
        self.bindings.insert(name.into(), Binding { value, visibility });
    }

    /// Installs an already-shared cell into this environment's captured
    /// table — used when a closure is created, so its captured environment
    /// holds the very cell its creator's `capture_cell` produced.
    pub fn define_captured_cell(&mut self, name: impl Into<String>, cell: Arc<Mutex<Value>>) {
        self.captured.insert(name.into(), cell);
    }

    pub fn captured_names(&self) -> Vec<String> {
        self.captured.keys().cloned().collect()
    }

    pub fn own_names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }
}

/// Looks up `name` following spec §3's order: captured table, own bindings,
/// closure-parent chain, lexical-parent chain.
pub fn lookup(env: &EnvRef, name: &str) -> Option<Value> {
    let (closure_parent, lexical_parent) = {
        let e = env.lock().unwrap();
        if let Some(cell) = e.captured.get(name) {
            return Some(cell.lock().unwrap().clone());
        }
        if let Some(b) = e.bindings.get(name) {
            return Some(b.value.clone());
        }
        (e.closure_parent.clone(), e.lexical_parent.clone())
    };
    if let Some(parent) = closure_parent {
        if let Some(v) = lookup(&parent, name) {
            return Some(v);
        }
    }
    if let Some(parent) = lexical_parent {
        return lookup(&parent, name);
    }
    None
}

/// Defines (or redefines) `name` in the current scope only, never walking up
/// the chain — the shadowing variant of `define`.
pub fn define_here(env: &EnvRef, name: impl Into<String>, value: Value) {
    env.lock().unwrap().define(name, value);
}

/// Assigns to the first binding found walking the same chain as `lookup`,
/// mutating in place. Returns false if no binding exists anywhere in the
/// chain, in which case the caller is responsible for deciding whether that
/// is an error or an implicit definition.
pub fn assign(env: &EnvRef, name: &str, value: Value) -> bool {
    let (closure_parent, lexical_parent) = {
        let mut e = env.lock().unwrap();
        if let Some(cell) = e.captured.get(name) {
            *cell.lock().unwrap() = value;
            return true;
        }
        if let Some(b) = e.bindings.get_mut(name) {
            b.value = value;
            return true;
        }
        (e.closure_parent.clone(), e.lexical_parent.clone())
    };
    if let Some(parent) = closure_parent {
        if assign(&parent, name, value.clone()) {
            return true;
        }
    }
    if let Some(parent) = lexical_parent {
        return assign(&parent, name, value);
    }
    false
}

/// Looks up a binding's declared visibility, used by module property access
/// to reject `Private`/`Protected` names from outside the module.
pub fn visibility_of(env: &EnvRef, name: &str) -> Option<Visibility> {
    env.lock().unwrap().bindings.get(name).map(|b| b.visibility)
}

/// Gets or lazily creates the shared capture cell for `name` on `env`
/// itself. Two `CaptureVar`
/// opcodes executed against the same environment node — e.g. two closures
/// created in the same function activation without an intervening scope —
/// receive the identical `Arc`, so later mutation through one closure's
/// captured copy of `name` is visible through the other's. A `CaptureVar`
/// against a *different* environment node (a fresh scope per loop
/// iteration, say) gets its own independent cell, preserving capture-by-
/// value semantics for the common "closures in a loop" case.
pub fn capture_cell(env: &EnvRef, name: &str) -> Option<Arc<Mutex<Value>>> {
    {
        let e = env.lock().unwrap();
        if let Some(cell) = e.capture_cells.get(name) {
            return Some(Arc::clone(cell));
        }
    }
    let current = lookup(env, name)?;
    let mut e = env.lock().unwrap();
    let cell = e.capture_cells.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(current))).clone();
    Some(cell)
}

/// The `(name, cell)` pairs a closure's own captured environment holds —
/// used by the closure tracker to key the shared-variable count by cell
/// identity rather than by name.
pub fn captured_cells(env: &EnvRef) -> Vec<(String, Arc<Mutex<Value>>)> {
    env.lock().unwrap().captured.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_lexical_parent_chain() {
        let root = Environment::new_root();
        define_here(&root, "x", Value::int(1));
        let child = Environment::new_child(&root);
        assert_eq!(lookup(&child, "x").map(|v| matches!(v, Value::Int(1, _))), Some(true));
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let root = Environment::new_root();
        define_here(&root, "x", Value::int(1));
        let child = Environment::new_child(&root);
        define_here(&child, "x", Value::int(2));
        match lookup(&child, "x") {
            Some(Value::Int(2, _)) => {}
            other => panic!("expected shadowed Int(2), got {other:?}"),
        }
        // outer scope is untouched
        match lookup(&root, "x") {
            Some(Value::Int(1, _)) => {}
            other => panic!("expected outer Int(1), got {other:?}"),
        }
    }

    #[test]
    fn captured_table_takes_priority_over_bindings() {
        let root = Environment::new_root();
        define_here(&root, "x", Value::int(1));
        root.lock().unwrap().define_captured_cell("x", Arc::new(Mutex::new(Value::int(99))));
        match lookup(&root, "x") {
            Some(Value::Int(99, _)) => {}
            other => panic!("expected captured Int(99), got {other:?}"),
        }
    }

    #[test]
    fn assign_mutates_the_first_binding_found() {
        let root = Environment::new_root();
        define_here(&root, "x", Value::int(1));
        let child = Environment::new_child(&root);
        assert!(assign(&child, "x", Value::int(5)));
        match lookup(&root, "x") {
            Some(Value::Int(5, _)) => {}
            other => panic!("expected Int(5) after assign through chain, got {other:?}"),
        }
    }

    #[test]
    fn assign_to_undefined_name_returns_false() {
        let root = Environment::new_root();
        assert!(!assign(&root, "missing", Value::Nil));
    }

    #[test]
    fn closure_parent_is_consulted_before_lexical_parent() {
        let lexical_root = Environment::new_root();
        define_here(&lexical_root, "x", Value::int(111));
        let closure_root = Environment::new_root();
        define_here(&closure_root, "x", Value::int(222));

        let call_env = Environment::new_closure_child(&lexical_root, &closure_root);
        match lookup(&call_env, "x") {
            Some(Value::Int(222, _)) => {}
            other => panic!("expected closure-parent value Int(222), got {other:?}"),
        }
    }

    #[test]
    fn environment_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EnvRef>();
    }

    #[test]
    fn repeated_capture_of_the_same_name_on_the_same_env_shares_a_cell() {
        let root = Environment::new_root();
        define_here(&root, "count", Value::int(0));
        let cell_a = capture_cell(&root, "count").unwrap();
        let cell_b = capture_cell(&root, "count").unwrap();
        assert!(Arc::ptr_eq(&cell_a, &cell_b));
        *cell_a.lock().unwrap() = Value::int(3);
        match *cell_b.lock().unwrap() {
            Value::Int(3, _) => {}
            ref other => panic!("expected mutation through cell_a visible via cell_b, got {other:?}"),
        }
    }

    #[test]
    fn capture_cell_on_distinct_envs_is_independent() {
        let root = Environment::new_root();
        define_here(&root, "i", Value::int(0));
        let iter_one = Environment::new_child(&root);
        define_here(&iter_one, "i", Value::int(1));
        let iter_two = Environment::new_child(&root);
        define_here(&iter_two, "i", Value::int(2));

        let cell_one = capture_cell(&iter_one, "i").unwrap();
        let cell_two = capture_cell(&iter_two, "i").unwrap();
        assert!(!Arc::ptr_eq(&cell_one, &cell_two));
        match (*cell_one.lock().unwrap(), *cell_two.lock().unwrap()) {
            (Value::Int(1, _), Value::Int(2, _)) => {}
            other => panic!("expected independent snapshots, got {other:?}"),
        }
    }
}
