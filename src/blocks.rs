// File: src/blocks.rs
//
// parallel/concurrent block execution: `BeginParallel`/
// `BeginConcurrent` push a block's parsed parameters; `BeginTask` marks the
// loop variable name; `StoreIterable` pops the iterable, spawns one task VM
// per element onto the work-stealing thread pool, waits for completion under
// the block's timeout/grace/on_error policy, and jumps the main VM past the
// task body (which already ran off-thread); `EndTask` is a no-op landing
// pad; `EndParallel`/`EndConcurrent` pop the block state and push its result.
//
// Kept in its own `impl Interpreter` so interpreter.rs's sequential dispatch
// loop stays focused on single-threaded opcodes. Builds directly on
// `concurrency::runtime::ConcurrencyRuntime` (scheduler, thread pool, named
// channels, shared error collector) and spawns task VMs via
// `Interpreter::spawn_task`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::bytecode::OpCode;
use crate::concurrency::runtime::{ErrorHandlingStrategy, TimeoutAction, MAX_RETRY_ATTEMPTS};
use crate::concurrency::scheduler::Task;
use crate::errors::{ErrorKind, RuntimeError, SourceLocation};
use crate::interpreter::{Flow, Interpreter};
use crate::value::{ErrorUnion, ErrorValue, Value};

/// Parsed `key=value(,key=value)*` block parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockParams {
    pub ch: Option<String>,
    pub mode: Option<String>,
    pub cores: Option<usize>,
    pub on_error: ErrorHandlingStrategy,
    pub timeout: Option<Duration>,
    pub grace: Option<Duration>,
    pub on_timeout: TimeoutAction,
}

impl Default for BlockParams {
    fn default() -> Self {
        BlockParams {
            ch: None,
            mode: None,
            cores: None,
            on_error: ErrorHandlingStrategy::Stop,
            timeout: None,
            grace: None,
            on_timeout: TimeoutAction::Partial,
        }
    }
}

/// Per-block state pushed by `BeginParallel`/`BeginConcurrent` and popped by
/// `EndParallel`/`EndConcurrent`. `previous_strategy` lets a block borrow the
/// runtime's single `ErrorHandlingStrategy` slot for its duration and hand it
/// back afterward, since `ConcurrencyRuntime` holds one strategy, not a stack
/// of them (see DESIGN.md — nested blocks with different strategies are not
/// supported).
pub struct BlockExecutionState {
    pub params: BlockParams,
    pub task_var: Option<String>,
    pub result: Option<Value>,
    previous_strategy: ErrorHandlingStrategy,
}

/// Parses the `key=value(,key=value)*` syntax. Unknown keys are
/// ignored; a malformed value produces `MalformedBlockParameters`.
pub fn parse_block_params(raw: &str, ip: usize) -> Result<BlockParams, RuntimeError> {
    let mut params = BlockParams::default();
    if raw.trim().is_empty() {
        return Ok(params);
    }
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(malformed(ip, format!("expected key=value, got '{pair}'")));
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "ch" => params.ch = Some(value.to_string()),
            "mode" => params.mode = Some(value.to_string()),
            "cores" => {
                params.cores =
                    Some(value.parse::<usize>().map_err(|_| malformed(ip, format!("cores: not a number: '{value}'")))?);
            }
            "on_error" => {
                params.on_error = match value {
                    "stop" => ErrorHandlingStrategy::Stop,
                    "auto" => ErrorHandlingStrategy::Auto,
                    "retry" => ErrorHandlingStrategy::Retry,
                    other => return Err(malformed(ip, format!("on_error: unknown strategy '{other}'"))),
                };
            }
            "timeout" => {
                let ms = value.parse::<u64>().map_err(|_| malformed(ip, format!("timeout: not a number: '{value}'")))?;
                params.timeout = Some(Duration::from_millis(ms));
            }
            "grace" => {
                let ms = value.parse::<u64>().map_err(|_| malformed(ip, format!("grace: not a number: '{value}'")))?;
                params.grace = Some(Duration::from_millis(ms));
            }
            "on_timeout" => {
                params.on_timeout = match value {
                    "partial" => TimeoutAction::Partial,
                    "error" => TimeoutAction::Error,
                    other => return Err(malformed(ip, format!("on_timeout: unknown action '{other}'"))),
                };
            }
            _ => {} // unknown keys are ignored,
        }
    }
    Ok(params)
}

fn malformed(ip: usize, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::MalformedBlockParameters, message, SourceLocation::at(ip))
}

/// Shared completion tracking for one block's in-flight tasks: a slot per
/// element, a completion counter, and the lock/condvar pair the spawning
/// thread waits on.
///
/// `cancelled` is the block's cooperative-cancellation flag (spec §4.6's
/// `shouldCancel`): a task checks it before running its attempts and again
/// before recording a result, and `on_error=Stop` flips it the moment the
/// first task error is observed, so tasks still queued or mid-attempt-loop
/// can bail without running every remaining retry to completion.
struct Completion {
    slots: Mutex<Vec<Option<Value>>>,
    done: AtomicUsize,
    lock: Mutex<()>,
    condvar: Condvar,
    cancelled: AtomicBool,
}

impl Interpreter {
    pub(crate) fn begin_block(&mut self, params: String, concurrent: bool) -> Result<Flow, RuntimeError> {
        let mut params = parse_block_params(&params, self.ip)?;
        if params.mode.is_none() {
            params.mode = Some(if concurrent { "concurrent" } else { "parallel" }.to_string());
        }
        if let Some(ch_name) = &params.ch {
            self.concurrency.channel_manager().create_channel(ch_name.clone());
        }
        self.concurrency.error_collector().clear();
        let previous_strategy = self.concurrency.error_handling_strategy();
        self.concurrency.set_error_handling_strategy(params.on_error);
        self.concurrency.increment_active_blocks();
        self.block_stack.push(BlockExecutionState { params, task_var: None, result: None, previous_strategy });
        Ok(Flow::Next)
    }

    pub(crate) fn end_block(&mut self) -> Result<Flow, RuntimeError> {
        let block = self
            .block_stack
            .pop()
            .ok_or_else(|| self.fatal(ErrorKind::MalformedBlockParameters, "end_block with no matching begin_block"))?;
        self.concurrency.set_error_handling_strategy(block.previous_strategy);
        self.concurrency.decrement_active_blocks();
        self.stack.push(block.result.unwrap_or(Value::Nil));
        Ok(Flow::Next)
    }

    /// Pops the iterable, locates the matching `EndTask`, runs one task VM
    /// per element, and jumps `self.ip` to that `EndTask` so the main thread
    /// never executes the body it just ran off-thread.
    pub(crate) fn handle_store_iterable(&mut self) -> Result<Flow, RuntimeError> {
        let iterable = self.pop()?;
        let elements = crate::interpreter::elements_of(&iterable)
            .ok_or_else(|| self.fatal(ErrorKind::TypeError, format!("cannot iterate over {}", iterable.type_name())))?;

        let body_start = self.ip + 1;
        let body_end = find_matching_end_task(self, body_start);

        let task_var = self
            .block_stack
            .last()
            .and_then(|b| b.task_var.clone())
            .ok_or_else(|| self.fatal(ErrorKind::MalformedBlockParameters, "store_iterable with no enclosing task"))?;
        let params = self.block_stack.last().map(|b| b.params.clone()).unwrap_or_default();

        let result = self.run_block_body(&task_var, &elements, body_start, body_end, &params)?;

        if let Some(block) = self.block_stack.last_mut() {
            block.result = Some(result);
        }
        self.ip = body_end;
        Ok(Flow::Jumped)
    }

    /// Spawns one task VM per element, waits for completion under `params`'s
    /// timeout/grace/on_error policy, and returns the aggregated result (a
    /// list of per-element values/error-unions, or a single error-union if
    /// `on_error = stop` saw a failure, or a timeout error-union under
    /// `on_timeout = error`).
    fn run_block_body(
        &mut self,
        task_var: &str,
        elements: &[Value],
        body_start: usize,
        body_end: usize,
        params: &BlockParams,
    ) -> Result<Value, RuntimeError> {
        if elements.is_empty() {
            return Ok(Value::list(Vec::new()));
        }

        let attempts = if params.on_error == ErrorHandlingStrategy::Retry { MAX_RETRY_ATTEMPTS } else { 1 };
        let completion = Arc::new(Completion {
            slots: Mutex::new(vec![None; elements.len()]),
            done: AtomicUsize::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let channel = params.ch.as_ref().and_then(|name| self.concurrency.channel_manager().get_channel(name));
        let error_collector = Arc::clone(self.concurrency.error_collector());
        let on_error = params.on_error;

        for (index, element) in elements.iter().cloned().enumerate() {
            // Built eagerly so a retry never needs to reach back into `self`
            // from the worker thread: each attempt gets its own fresh task VM.
            let mut pending_attempts: Vec<Interpreter> =
                (0..attempts).map(|_| self.spawn_task(task_var, element.clone())).collect();
            let completion = Arc::clone(&completion);
            let error_collector = Arc::clone(&error_collector);
            let channel = channel.clone();

            let task: Task = Box::new(move || {
                let finish = |completion: &Completion| {
                    completion.done.fetch_add(1, Ordering::SeqCst);
                    let _guard = completion.lock.lock().unwrap();
                    completion.condvar.notify_all();
                };

                // Cooperative cancellation, checked before a queued task does
                // any work: once `on_error=Stop` sees its first failure,
                // tasks that have not yet started skip straight to done.
                if completion.cancelled.load(Ordering::SeqCst) {
                    finish(&completion);
                    return;
                }

                let mut last_error = None;
                let mut success = None;
                while let Some(mut attempt_vm) = pending_attempts.pop() {
                    match attempt_vm.run_from(body_start, body_end) {
                        Ok(value) => {
                            success = Some(value);
                            last_error = None;
                            break;
                        }
                        Err(e) => last_error = Some(e),
                    }
                }

                // Checked again after running: a task cancelled mid-retry by
                // a sibling's failure still completed the work it was given,
                // but its result is dropped rather than recorded or sent.
                if completion.cancelled.load(Ordering::SeqCst) {
                    finish(&completion);
                    return;
                }

                let value = match success {
                    Some(v) => v,
                    None => {
                        let e = last_error.expect("a task always attempts at least once");
                        let error_value = ErrorValue::new(e.kind.to_string(), e.message);
                        error_collector.add_error(error_value.clone());
                        Value::ErrorUnion(Box::new(ErrorUnion::err(error_value)))
                    }
                };
                // Only successful results reach the output channel; errors
                // are reported through the error collector instead.
                let is_error = matches!(&value, Value::ErrorUnion(u) if u.is_error());
                if is_error && on_error == ErrorHandlingStrategy::Stop {
                    completion.cancelled.store(true, Ordering::SeqCst);
                }
                if !is_error {
                    if let Some(ch) = &channel {
                        let _ = ch.send(value.clone());
                    }
                }
                completion.slots.lock().unwrap()[index] = Some(value);
                finish(&completion);
            });

            match params.cores {
                Some(cores) if cores > 0 => self.concurrency.thread_pool().submit_to_worker(index % cores, task),
                _ => self.concurrency.thread_pool().submit(task),
            }
        }

        let total = elements.len();
        {
            let guard = completion.lock.lock().unwrap();
            if let Some(timeout) = params.timeout {
                let _ = completion.condvar.wait_timeout_while(guard, timeout, |_| completion.done.load(Ordering::SeqCst) < total);
            } else {
                let _ = completion.condvar.wait_while(guard, |_| completion.done.load(Ordering::SeqCst) < total);
            }
        }

        let mut finished = completion.done.load(Ordering::SeqCst) >= total;
        if !finished {
            if let Some(grace) = params.grace {
                let guard = completion.lock.lock().unwrap();
                let _ = completion.condvar.wait_timeout_while(guard, grace, |_| completion.done.load(Ordering::SeqCst) < total);
                finished = completion.done.load(Ordering::SeqCst) >= total;
            }
        }

        if !finished && params.on_timeout == TimeoutAction::Error {
            let missing = total - completion.done.load(Ordering::SeqCst);
            let err = ErrorValue::new("TimeoutError", format!("block timed out with {missing}/{total} tasks incomplete"));
            return Ok(Value::ErrorUnion(Box::new(ErrorUnion::err(err))));
        }

        if let Some(ch_name) = &params.ch {
            self.concurrency.channel_manager().close_channel(ch_name);
        }

        if params.on_error == ErrorHandlingStrategy::Stop && error_collector.has_errors() {
            let first = error_collector.errors().into_iter().next().expect("has_errors implies non-empty");
            return Ok(Value::ErrorUnion(Box::new(ErrorUnion::err(first))));
        }

        let results: Vec<Value> =
            completion.slots.lock().unwrap().iter().map(|slot| slot.clone().unwrap_or(Value::Nil)).collect();
        Ok(Value::list(results))
    }
}

/// Scans forward from `body_start` (the instruction right after
/// `StoreIterable`) for the `EndTask` matching the enclosing `BeginTask`,
/// tracking nesting depth for tasks defined inside the body.
fn find_matching_end_task(interp: &Interpreter, body_start: usize) -> usize {
    let instrs = &interp.bytecode.instructions;
    let mut depth = 1;
    let mut i = body_start;
    while i < instrs.len() {
        match &instrs[i].opcode {
            OpCode::BeginTask(_) => depth += 1,
            OpCode::EndTask => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
    instrs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_params_string_parses_to_defaults() {
        let params = parse_block_params("", 0).unwrap();
        assert_eq!(params.on_error, ErrorHandlingStrategy::Stop);
        assert_eq!(params.on_timeout, TimeoutAction::Partial);
        assert!(params.timeout.is_none());
    }

    #[test]
    fn params_parse_known_keys() {
        let params = parse_block_params("cores=4,on_error=retry,timeout=500,grace=50,on_timeout=error,ch=out", 0).unwrap();
        assert_eq!(params.cores, Some(4));
        assert_eq!(params.on_error, ErrorHandlingStrategy::Retry);
        assert_eq!(params.timeout, Some(Duration::from_millis(500)));
        assert_eq!(params.grace, Some(Duration::from_millis(50)));
        assert_eq!(params.on_timeout, TimeoutAction::Error);
        assert_eq!(params.ch.as_deref(), Some("out"));
    }

    #[test]
    fn unknown_keys_are_silently_ignored() {
        let params = parse_block_params("frobnicate=true", 0).unwrap();
        assert_eq!(params, BlockParams::default());
    }

    #[test]
    fn malformed_numeric_value_is_an_error() {
        let err = parse_block_params("cores=many", 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedBlockParameters);
    }

    #[test]
    fn unknown_on_error_value_is_an_error() {
        assert!(parse_block_params("on_error=maybe", 0).is_err());
    }
}
