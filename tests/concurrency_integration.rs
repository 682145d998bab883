// Concurrency-facing end-to-end scenarios: a real `parallel` block driven
// through bytecode, and the work-stealing thread pool exercised directly
// through its public API. Complements the single-threaded scenarios in
// `tests/vm_integration.rs`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strandvm::bytecode::OpCode::*;
use strandvm::bytecode::{BytecodeChunk, Constant, Instruction};
use strandvm::concurrency::scheduler::Scheduler;
use strandvm::concurrency::thread_pool::ThreadPool;
use strandvm::natives::{self, NativeRegistry};
use strandvm::value::{IntWidth, Value};
use strandvm::Interpreter;

fn interp(instructions: Vec<Instruction>, constants: Vec<Constant>) -> Interpreter {
    let mut natives = NativeRegistry::new();
    natives::install_default_natives(&mut natives);
    Interpreter::new(Arc::new(BytecodeChunk::new(instructions, constants)), natives, 4)
}

/// A `parallel(on_error=auto, ch=out)` block over `[0, 1, 2, 3, 4]` where the
/// task for `i == 2` raises `ValueError("bad")`: the block still completes
/// with one entry per element (four successes plus the one failing task's
/// error union), and the failure is not retried (`on_error = auto`, not
/// `retry`, so each task runs exactly once).
#[test]
fn parallel_block_with_auto_error_handling_collects_partial_results() {
    let constants = vec![
        Constant::Int(0, IntWidth::I64),
        Constant::Int(1, IntWidth::I64),
        Constant::Int(2, IntWidth::I64),
        Constant::Int(3, IntWidth::I64),
        Constant::Int(4, IntWidth::I64),
        Constant::Str("bad".to_string()),
    ];
    let instructions = vec![
        /*0*/ Instruction::new(BeginParallel("on_error=auto,ch=out".into()), 1),
        /*1*/ Instruction::new(BeginTask("i".into()), 1),
        /*2*/ Instruction::new(LoadConst(0), 1),
        /*3*/ Instruction::new(LoadConst(1), 1),
        /*4*/ Instruction::new(LoadConst(2), 1),
        /*5*/ Instruction::new(LoadConst(3), 1),
        /*6*/ Instruction::new(LoadConst(4), 1),
        /*7*/ Instruction::new(BuildList(5), 1),
        /*8*/ Instruction::new(StoreIterable, 1), // body: [9, 17)
        /*9*/ Instruction::new(LoadVar("i".into()), 1),
        /*10*/ Instruction::new(LoadConst(2), 1),
        /*11*/ Instruction::new(Equal, 1),
        /*12*/ Instruction::new(JumpIfFalse(16), 1),
        /*13*/ Instruction::new(LoadConst(5), 1),
        /*14*/ Instruction::new(ConstructError { error_type: "ValueError".into(), argc: 1 }, 1),
        /*15*/ Instruction::new(PropagateError, 1),
        /*16*/ Instruction::new(LoadVar("i".into()), 1),
        /*17*/ Instruction::new(EndTask, 1),
        /*18*/ Instruction::new(EndParallel, 1),
        /*19*/ Instruction::new(Halt, 1),
    ];
    let mut vm = interp(instructions, constants);
    let result = vm.execute().expect("on_error=auto must not fail the enclosing program");

    let Value::List(list) = result else { panic!("expected the block to return a list, got {result:?}") };
    let items = list.lock().unwrap().clone();
    assert_eq!(items.len(), 5, "one result slot per task");

    let mut ok_values: Vec<i64> = Vec::new();
    let mut error_count = 0;
    for item in &items {
        match item {
            Value::Int(n, _) => ok_values.push(*n),
            Value::ErrorUnion(u) if u.is_error() => {
                error_count += 1;
                let message = u.payload.as_ref().unwrap_err().message.clone();
                assert!(message.contains("ValueError") && message.contains("bad"), "unexpected error message: {message}");
            }
            other => panic!("unexpected per-task result: {other:?}"),
        }
    }
    ok_values.sort_unstable();
    assert_eq!(ok_values, vec![0, 1, 3, 4], "every non-failing task must still have a result");
    assert_eq!(error_count, 1, "exactly one task (i == 2) must have failed");
}

/// A `parallel(on_error=stop, cores=1)` block over five elements, pinned to
/// a single worker so submission order and execution order coincide: the
/// task for `i == 0` fails immediately, and every later task checks the
/// block's cooperative-cancellation flag before calling `mark_ran` — so if
/// cancellation is wired up, none of them ever do.
#[test]
fn stop_strategy_cancels_tasks_queued_behind_the_first_failure() {
    let ran_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran_count);
    let mut natives = NativeRegistry::new();
    natives::install_default_natives(&mut natives);
    natives.register_builtin(
        "mark_ran",
        Arc::new(move |_args: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Nil)
        }),
    );

    let constants = vec![
        Constant::Int(0, IntWidth::I64),
        Constant::Int(1, IntWidth::I64),
        Constant::Int(2, IntWidth::I64),
        Constant::Int(3, IntWidth::I64),
        Constant::Int(4, IntWidth::I64),
        Constant::Str("bad".to_string()),
    ];
    let instructions = vec![
        /*0*/ Instruction::new(BeginParallel("on_error=stop,cores=1".into()), 1),
        /*1*/ Instruction::new(BeginTask("i".into()), 1),
        /*2*/ Instruction::new(LoadConst(0), 1),
        /*3*/ Instruction::new(LoadConst(1), 1),
        /*4*/ Instruction::new(LoadConst(2), 1),
        /*5*/ Instruction::new(LoadConst(3), 1),
        /*6*/ Instruction::new(LoadConst(4), 1),
        /*7*/ Instruction::new(BuildList(5), 1),
        /*8*/ Instruction::new(StoreIterable, 1), // body: [9, 17)
        /*9*/ Instruction::new(LoadVar("i".into()), 1),
        /*10*/ Instruction::new(LoadConst(0), 1),
        /*11*/ Instruction::new(Equal, 1),
        /*12*/ Instruction::new(JumpIfFalse(16), 1),
        /*13*/ Instruction::new(LoadConst(5), 1),
        /*14*/ Instruction::new(ConstructError { error_type: "ValueError".into(), argc: 1 }, 1),
        /*15*/ Instruction::new(PropagateError, 1),
        /*16*/ Instruction::new(Call { name: "mark_ran".into(), argc: 0 }, 1),
        /*17*/ Instruction::new(EndTask, 1),
        /*18*/ Instruction::new(EndParallel, 1),
        /*19*/ Instruction::new(Halt, 1),
    ];
    let mut vm = Interpreter::new(Arc::new(BytecodeChunk::new(instructions, constants)), natives, 4);
    let result = vm.execute().expect("on_error=stop surfaces as a returned error union, not a fatal Err");

    match result {
        Value::ErrorUnion(u) if u.is_error() => {
            let message = u.payload.as_ref().unwrap_err().message.clone();
            assert!(message.contains("ValueError") && message.contains("bad"), "unexpected error message: {message}");
        }
        other => panic!("expected the block's result to be the propagated error union, got {other:?}"),
    }

    assert_eq!(
        ran_count.load(Ordering::SeqCst),
        0,
        "tasks queued behind the first on_error=stop failure must be cancelled, not executed"
    );
}

/// A pool of four workers with every task submitted to worker 0: the other
/// three can only make progress by stealing from the back of its queue, so
/// work distributes even under maximally unbalanced submission.
#[test]
fn work_submitted_to_one_worker_is_stolen_and_completed_by_the_rest() {
    let pool = ThreadPool::new(4, Arc::new(Scheduler::new()));
    pool.start();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..400 {
        let c = Arc::clone(&counter);
        pool.submit_to_worker(0, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
    }
    thread::sleep(Duration::from_millis(500));
    pool.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 400, "every task must still run even when all land on one worker");
}
