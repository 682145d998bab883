// File: src/closures.rs
//
// The closure subsystem: capture, per-closure tracking, the
// shared-variable optimization, and one-hop cycle detection.
//
// Cyclic closure graphs are handled with weak back-edges: closures are
// tracked in a side table keyed by id holding only weak references, so
// reachability is governed by ordinary Rust ownership (`Arc` strong counts)
// and cycles are found by a one-hop walk rather than a tracing collector.
//
// The shared-variable optimization is keyed by
// *cell identity*, not by variable name: `environment::capture_cell` is what
// actually decides whether two closures share storage (same environment
// node + same name -> same `Arc<Mutex<Value>>`), this module just observes
// that decision and counts it. Keying by name alone would conflate unrelated
// same-named locals from different call activations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::environment::{self, EnvRef};
use crate::value::Closure;

static NEXT_CLOSURE_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_closure_id() -> u64 {
    NEXT_CLOSURE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a capture cell by its `Arc` allocation address — stable for
/// as long as the cell is alive, and distinct per capture site even when
/// two unrelated variables share a name.
type CellKey = usize;

struct TrackedClosure {
    weak: Weak<Closure>,
    captured_variable_names: Vec<String>,
    cell_keys: Vec<CellKey>,
    circular: bool,
}

/// Tracks every closure created during execution via a weak reference, plus
/// a reverse index from capture-cell identity to the closures that captured
/// it (the shared-variable optimization's bookkeeping).
#[derive(Default)]
pub struct ClosureTracker {
    active: HashMap<u64, TrackedClosure>,
    by_cell: HashMap<CellKey, Vec<u64>>,
}

impl ClosureTracker {
    pub fn new() -> Self {
        ClosureTracker::default()
    }

    /// Registers `closure` for tracking, reading the `(name, cell)` pairs
    /// its own captured environment holds to discover which cells — if
    /// any — it shares with previously tracked closures.
    pub fn track(&mut self, closure: &Arc<Closure>) {
        let id = closure.id;
        let cells = environment::captured_cells(&closure.captured_environment);
        let cell_keys: Vec<CellKey> = cells.iter().map(|(_, cell)| Arc::as_ptr(cell) as usize).collect();
        self.active.insert(
            id,
            TrackedClosure {
                weak: Arc::downgrade(closure),
                captured_variable_names: closure.captured_variable_names.clone(),
                cell_keys: cell_keys.clone(),
                circular: false,
            },
        );
        for key in cell_keys {
            self.by_cell.entry(key).or_default().push(id);
        }
    }

    /// The number of distinct capture cells currently shared by more than
    /// one live, tracked closure.
    pub fn shared_variable_count(&self) -> usize {
        self.by_cell.values().filter(|ids| ids.len() > 1).count()
    }

    pub fn is_circular(&self, id: u64) -> bool {
        self.active.get(&id).map(|t| t.circular).unwrap_or(false)
    }

    /// One-hop cycle detection: flags A and B as circular when A captures a
    /// variable bound to closure B, and B's captured environment holds a
    /// back-reference to A. `resolve_captured_closure` is
    /// supplied by the caller since resolving a captured name to a `Value`
    /// requires walking the environment, which this module does not own.
    pub fn detect_cycles<F>(&mut self, mut resolve_captured_closure: F)
    where
        F: FnMut(&EnvRef, &str) -> Option<u64>,
    {
        let ids: Vec<u64> = self.active.keys().copied().collect();
        for id in ids {
            let (env, names) = {
                let Some(entry) = self.active.get(&id) else { continue };
                let Some(closure) = entry.weak.upgrade() else { continue };
                (closure.captured_environment.clone(), entry.captured_variable_names.clone())
            };
            for name in names {
                if let Some(other_id) = resolve_captured_closure(&env, &name) {
                    if other_id == id {
                        continue;
                    }
                    let back_ref = {
                        let Some(other_entry) = self.active.get(&other_id) else { continue };
                        let Some(other_closure) = other_entry.weak.upgrade() else { continue };
                        other_entry
                            .captured_variable_names
                            .iter()
                            .any(|n| resolve_captured_closure(&other_closure.captured_environment, n) == Some(id))
                    };
                    if back_ref {
                        if let Some(e) = self.active.get_mut(&id) {
                            e.circular = true;
                        }
                        if let Some(e) = self.active.get_mut(&other_id) {
                            e.circular = true;
                        }
                    }
                }
            }
        }
    }

    /// Garbage collection: drops tracking entries whose closure has no live
    /// strong reference left, and prunes cell entries no longer captured by
    /// any tracked closure. Run every 1000 instructions and every 10 returns
    ///.
    pub fn collect_garbage(&mut self) {
        let dead: Vec<u64> = self
            .active
            .iter()
            .filter(|(_, t)| t.weak.upgrade().is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            if let Some(entry) = self.active.remove(id) {
                for key in &entry.cell_keys {
                    if let Some(ids) = self.by_cell.get_mut(key) {
                        ids.retain(|i| i != id);
                    }
                }
            }
        }
        self.by_cell.retain(|_, ids| !ids.is_empty());
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::value::Value;

    /// Builds a closure whose captured environment holds one cell per name
    /// in `shared_with`, reusing `source`'s capture cells so closures built
    /// from the same `source` env actually share storage (mirroring what
    /// `Interpreter::handle_create_closure` does for two `CreateClosure`
    /// calls against the same activation).
    fn make_closure(id: u64, source: &EnvRef, names: &[&str]) -> Arc<Closure> {
        let captured_environment = Environment::new_child(source);
        for name in names {
            let cell = environment::capture_cell(source, name).expect("name defined on source env");
            captured_environment.lock().unwrap().define_captured_cell(name.to_string(), cell);
        }
        Arc::new(Closure {
            id,
            function_name: format!("<lambda_{id}>"),
            start_address: 0,
            end_address: 0,
            captured_environment,
            captured_variable_names: names.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn two_closures_over_the_same_source_env_and_name_share_a_cell() {
        let source = Environment::new_root();
        environment::define_here(&source, "count", Value::int(0));
        let mut tracker = ClosureTracker::new();
        let a = make_closure(1, &source, &["count"]);
        let b = make_closure(2, &source, &["count"]);
        tracker.track(&a);
        tracker.track(&b);
        assert_eq!(tracker.shared_variable_count(), 1);

        // Mutating through `a`'s captured cell must be visible through `b`'s.
        let cell_a = environment::captured_cells(&a.captured_environment).remove(0).1;
        let cell_b = environment::captured_cells(&b.captured_environment).remove(0).1;
        assert!(Arc::ptr_eq(&cell_a, &cell_b));
    }

    #[test]
    fn closures_from_distinct_source_envs_do_not_share() {
        let mut tracker = ClosureTracker::new();
        let source_one = Environment::new_root();
        environment::define_here(&source_one, "x", Value::int(1));
        let source_two = Environment::new_root();
        environment::define_here(&source_two, "x", Value::int(2));
        let a = make_closure(1, &source_one, &["x"]);
        let b = make_closure(2, &source_two, &["x"]);
        tracker.track(&a);
        tracker.track(&b);
        assert_eq!(tracker.shared_variable_count(), 0);
    }

    #[test]
    fn collect_garbage_drops_expired_closures() {
        let mut tracker = ClosureTracker::new();
        let source = Environment::new_root();
        environment::define_here(&source, "x", Value::int(1));
        {
            let a = make_closure(1, &source, &["x"]);
            tracker.track(&a);
        }
        assert_eq!(tracker.active_count(), 1);
        tracker.collect_garbage();
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn single_capture_does_not_promote_a_shared_slot() {
        let mut tracker = ClosureTracker::new();
        let source = Environment::new_root();
        environment::define_here(&source, "solo", Value::int(1));
        let a = make_closure(1, &source, &["solo"]);
        tracker.track(&a);
        assert_eq!(tracker.shared_variable_count(), 0);
    }

    /// Two closures whose captured environments each hold a binding pointing
    /// back at the other (`a` captures `other` bound to `b`, `b` captures
    /// `other` bound to `a`) form a one-hop cycle: `detect_cycles` must flag
    /// both as circular given a resolver that reads those bindings back.
    #[test]
    fn mutually_capturing_closures_are_flagged_circular() {
        let mut tracker = ClosureTracker::new();
        let source = Environment::new_root();
        let a_env = Environment::new_child(&source);
        let b_env = Environment::new_child(&source);
        let a = Arc::new(Closure {
            id: 1,
            function_name: "<lambda_1>".to_string(),
            start_address: 0,
            end_address: 0,
            captured_environment: a_env.clone(),
            captured_variable_names: vec!["other".to_string()],
        });
        let b = Arc::new(Closure {
            id: 2,
            function_name: "<lambda_2>".to_string(),
            start_address: 0,
            end_address: 0,
            captured_environment: b_env.clone(),
            captured_variable_names: vec!["other".to_string()],
        });
        environment::define_here(&a_env, "other", Value::Closure(Arc::clone(&b)));
        environment::define_here(&b_env, "other", Value::Closure(Arc::clone(&a)));
        tracker.track(&a);
        tracker.track(&b);
        assert!(!tracker.is_circular(1));
        assert!(!tracker.is_circular(2));

        tracker.detect_cycles(|env, name| match environment::lookup(env, name) {
            Some(Value::Closure(closure)) => Some(closure.id),
            _ => None,
        });

        assert!(tracker.is_circular(1));
        assert!(tracker.is_circular(2));
    }

    /// A closure capturing an unrelated value (not a closure at all) must
    /// not be disturbed by cycle detection — the resolver simply yields
    /// `None` and no edge is recorded.
    #[test]
    fn non_closure_capture_does_not_trip_cycle_detection() {
        let mut tracker = ClosureTracker::new();
        let source = Environment::new_root();
        environment::define_here(&source, "count", Value::int(0));
        let a = make_closure(1, &source, &["count"]);
        tracker.track(&a);

        tracker.detect_cycles(|env, name| match environment::lookup(env, name) {
            Some(Value::Closure(closure)) => Some(closure.id),
            _ => None,
        });

        assert!(!tracker.is_circular(1));
    }
}
