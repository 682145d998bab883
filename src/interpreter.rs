// File: src/interpreter.rs
//
// The bytecode interpreter: opcode dispatch, the evaluation
// stack, the call-frame and error-frame stacks, and the function/closure/
// method/constructor call protocol. Grounded on the teacher's `vm.rs`
// `VM::execute` — a `match` on `OpCode` inside a `while self.ip < len` loop,
// operating on a flat `Vec<Value>` stack and an `ip: usize` — generalized
// from the teacher's tree of special-cased opcodes (arrays, generators,
// async/await, JIT) down to the closed set this crate's data model and
// error machine actually need, with the closure/class/module/error-frame
// machinery the teacher keeps inline pulled out into their own modules.
//
// `blocks.rs` extends this `impl Interpreter` with the parallel/concurrent
// block opcodes so this file stays focused on the sequential dispatch loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::arithmetic::{self, Ordering as CmpOrdering};
use crate::blocks::BlockExecutionState;
use crate::bytecode::{BytecodeChunk, OpCode};
use crate::closures::{self, ClosureTracker};
use crate::concurrency::runtime::ConcurrencyRuntime;
use crate::environment::{self, EnvRef, Environment};
use crate::errors::{ErrorKind, ErrorPool, RuntimeError, SourceLocation};
use crate::module::{self, ModuleLoader, ModuleValue};
use crate::natives::NativeRegistry;
use crate::pattern;
use crate::registry::{ClassRegistry, FunctionRegistry};
use crate::value::{
    AtomicCell, ClassDescriptor, Closure, ErrorUnion, ErrorValue, IntWidth, ObjectInstance, Value,
};

/// Closure GC runs every 1000 instructions and every 10 returns.
const CLOSURE_GC_INSTRUCTION_INTERVAL: u64 = 1000;
const CLOSURE_GC_RETURN_INTERVAL: u64 = 10;

#[derive(Debug, Clone)]
pub struct CallFrame {
    pub function_name: String,
    pub return_address: usize,
    pub previous_environment: EnvRef,
    pub is_closure_call: bool,
    pub closure_environment: Option<EnvRef>,
    /// Whether entering this call auto-pushed a wildcard `ErrorFrame` (spec
    /// §4.1/§4.2: every fallible function gets one). Tracked on the frame
    /// itself, rather than re-deriving it from the function registry at
    /// return time, so a successful return pops exactly the frame this call
    /// pushed — not a stale sibling's.
    pub pushed_error_frame: bool,
}

#[derive(Debug, Clone)]
pub struct ErrorFrame {
    pub handler_address: usize,
    pub stack_base: usize,
    /// `None` is a wildcard; `Some("ErrorUnion")` also acts as a wildcard —
    /// a frame whose expected type is itself an error-union catches
    /// anything.
    pub expected_error_type: Option<String>,
    pub function_name: String,
}

impl ErrorFrame {
    fn matches(&self, error_type: &str) -> bool {
        match &self.expected_error_type {
            None => true,
            Some(t) if t == "ErrorUnion" => true,
            Some(t) => t == error_type,
        }
    }
}

/// Accumulates `ImportModule`/`ImportAlias`/`ImportFilterShow`/
/// `ImportFilterHide`/`ImportAddIdentifier` opcodes until `ImportExecute`
/// fires.
#[derive(Debug, Clone, Default)]
struct PendingImport {
    path: String,
    alias: Option<String>,
    show: Option<Vec<String>>,
    hide: Option<Vec<String>>,
}

/// What a dispatched opcode did to the instruction pointer, so the main loop
/// knows whether to apply its own `+= 1`.
pub(crate) enum Flow {
    Next,
    Jumped,
    Halt,
}

/// The interpreter. One instance executes one bytecode chunk on the thread
/// that owns it; it is not `Send` and is never shared across threads — a
/// `parallel`/`concurrent` block spawns additional, fully independent
/// instances (task VMs) instead.
pub struct Interpreter {
    pub(crate) bytecode: Arc<BytecodeChunk>,
    pub(crate) ip: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) globals: EnvRef,
    pub(crate) environment: EnvRef,
    pub(crate) call_stack: Vec<CallFrame>,
    pub(crate) error_frames: Vec<ErrorFrame>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) classes: ClassRegistry,
    pub(crate) natives: NativeRegistry,
    pub(crate) modules: Arc<Mutex<ModuleLoader>>,
    pub(crate) closures: Arc<Mutex<ClosureTracker>>,
    pub(crate) error_pool: Arc<Mutex<ErrorPool>>,
    pub(crate) concurrency: Arc<ConcurrencyRuntime>,
    pub(crate) block_stack: Vec<BlockExecutionState>,
    current_class: Option<String>,
    pending_import: Option<PendingImport>,
    return_count: u64,
    instruction_count: u64,
    error_frame_pushes: u64,
}

impl Interpreter {
    pub fn new(bytecode: Arc<BytecodeChunk>, natives: NativeRegistry, worker_count: usize) -> Self {
        let globals = Environment::new_root();
        Interpreter {
            bytecode,
            ip: 0,
            stack: Vec::new(),
            environment: globals.clone(),
            globals,
            call_stack: Vec::new(),
            error_frames: Vec::new(),
            functions: FunctionRegistry::new(),
            classes: ClassRegistry::new(),
            natives,
            modules: Arc::new(Mutex::new(ModuleLoader::new())),
            closures: Arc::new(Mutex::new(ClosureTracker::new())),
            error_pool: Arc::new(Mutex::new(ErrorPool::new(64))),
            concurrency: Arc::new(ConcurrencyRuntime::new(worker_count)),
            block_stack: Vec::new(),
            current_class: None,
            pending_import: None,
            return_count: 0,
            instruction_count: 0,
            error_frame_pushes: 0,
        }
    }

    pub fn error_frame_pushes(&self) -> u64 {
        self.error_frame_pushes
    }

    pub fn error_pool_stats(&self) -> (u64, u64) {
        let pool = self.error_pool.lock().unwrap();
        (pool.hits(), pool.misses())
    }

    pub fn closure_tracker_stats(&self) -> (usize, usize) {
        let tracker = self.closures.lock().unwrap();
        (tracker.active_count(), tracker.shared_variable_count())
    }

    /// A subordinate interpreter sharing every cross-thread registry/runtime
    /// with `self` but with its own isolated stack, call/error-frame
    /// stacks, and environment — what a task VM or a module's top-level
    /// execution needs.
    pub(crate) fn child(&self, bytecode: Arc<BytecodeChunk>, environment: EnvRef) -> Interpreter {
        Interpreter {
            bytecode,
            ip: 0,
            stack: Vec::new(),
            globals: self.globals.clone(),
            environment,
            call_stack: Vec::new(),
            error_frames: Vec::new(),
            functions: FunctionRegistry::new(),
            classes: ClassRegistry::new(),
            natives: self.natives.clone(),
            modules: Arc::clone(&self.modules),
            closures: Arc::clone(&self.closures),
            error_pool: Arc::clone(&self.error_pool),
            concurrency: Arc::clone(&self.concurrency),
            block_stack: Vec::new(),
            current_class: None,
            pending_import: None,
            return_count: 0,
            instruction_count: 0,
            error_frame_pushes: 0,
        }
    }

    /// A task VM spawned for one iteration of a `parallel`/`concurrent`
    /// block: shares the parent's bytecode, function/class/native
    /// registries (the task body calls into functions defined in the
    /// spawning chunk) and every cross-thread runtime, but gets its own
    /// stack and an environment rooted at the spawning VM's globals with
    /// the loop variable bound.
    pub(crate) fn spawn_task(&self, task_var: &str, value: Value) -> Interpreter {
        let env = Environment::new_child(&self.globals);
        environment::define_here(&env, task_var.to_string(), value);
        Interpreter {
            bytecode: Arc::clone(&self.bytecode),
            ip: 0,
            stack: Vec::new(),
            globals: self.globals.clone(),
            environment: env,
            call_stack: Vec::new(),
            error_frames: Vec::new(),
            functions: self.functions.clone(),
            classes: self.classes.clone(),
            natives: self.natives.clone(),
            modules: Arc::clone(&self.modules),
            closures: Arc::clone(&self.closures),
            error_pool: Arc::clone(&self.error_pool),
            concurrency: Arc::clone(&self.concurrency),
            block_stack: Vec::new(),
            current_class: None,
            pending_import: None,
            return_count: 0,
            instruction_count: 0,
            error_frame_pushes: 0,
        }
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::new(ErrorKind::TypeError, "value stack underflow", SourceLocation::at(self.ip))
        })
    }

    pub(crate) fn fatal(&self, kind: ErrorKind, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(kind, message, SourceLocation::at(self.ip))
    }

    fn run_closure_gc(&self) {
        let mut tracker = self.closures.lock().unwrap();
        tracker.detect_cycles(|env, name| match environment::lookup(env, name) {
            Some(Value::Closure(closure)) => Some(closure.id),
            _ => None,
        });
        tracker.collect_garbage();
    }

    /// Runs the pre-pass then the dispatch loop until `Halt`,
    /// end of bytecode, or a fatal error.
    pub fn execute(&mut self) -> Result<Value, RuntimeError> {
        self.prepass_lambdas();
        self.run_from(0, self.bytecode.instructions.len())
    }

    /// Registers every `BeginFunction` whose name begins with the lambda
    /// marker so `PushLambda` succeeds for forward references.
    fn prepass_lambdas(&mut self) {
        let instrs = &self.bytecode.instructions;
        let mut i = 0;
        while i < instrs.len() {
            if let OpCode::BeginFunction { name } = &instrs[i].opcode {
                if name.starts_with("<lambda") {
                    let (sig, end) = scan_function(&self.bytecode, i, name.clone(), true);
                    self.functions.register(sig);
                    i = end + 1;
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Executes instructions in `[start, end)`. Calls may jump outside this
    /// range (into a function body elsewhere in the same chunk) and back
    /// again via `Return`; the loop only cares that `self.ip` re-enters
    /// `[start, end)` before it next checks the bound. Returns the last
    /// value left on the stack, or `Nil` if none.
    pub(crate) fn run_from(&mut self, start: usize, end: usize) -> Result<Value, RuntimeError> {
        self.ip = start;
        while self.ip < end {
            let opcode = self.bytecode.instructions[self.ip].opcode.clone();
            match self.dispatch(opcode)? {
                Flow::Next => self.ip += 1,
                Flow::Jumped => {}
                Flow::Halt => break,
            }
            self.instruction_count += 1;
            if self.instruction_count % CLOSURE_GC_INSTRUCTION_INTERVAL == 0 {
                self.run_closure_gc();
            }
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    fn dispatch(&mut self, opcode: OpCode) -> Result<Flow, RuntimeError> {
        match opcode {
            OpCode::LoadConst(idx) => {
                let value = self
                    .bytecode
                    .constants
                    .get(idx)
                    .ok_or_else(|| self.fatal(ErrorKind::TypeError, "constant pool index out of bounds"))?
                    .to_value();
                self.stack.push(value);
                Ok(Flow::Next)
            }
            OpCode::LoadVar(name) => {
                let value = environment::lookup(&self.environment, &name)
                    .ok_or_else(|| self.fatal(ErrorKind::UndefinedVariable, format!("undefined variable '{name}'")))?;
                self.stack.push(value);
                Ok(Flow::Next)
            }
            OpCode::StoreVar(name) => {
                let value = self.pop()?;
                if let Some(Value::Atomic(cell)) = environment::lookup(&self.environment, &name) {
                    store_into_atomic(&cell, &value);
                } else if !environment::assign(&self.environment, &name, value.clone()) {
                    environment::define_here(&self.environment, name, value);
                }
                Ok(Flow::Next)
            }
            OpCode::DefineVar(name) => {
                let value = self.pop()?;
                environment::define_here(&self.environment, name, value);
                Ok(Flow::Next)
            }
            OpCode::Pop => {
                self.pop()?;
                Ok(Flow::Next)
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or_else(|| {
                    self.fatal(ErrorKind::TypeError, "dup on empty stack")
                })?;
                self.stack.push(top);
                Ok(Flow::Next)
            }

            OpCode::Add => self.binary_arith(arithmetic::add),
            OpCode::Sub => self.binary_arith(arithmetic::sub),
            OpCode::Mul => self.binary_arith(arithmetic::mul),
            OpCode::Div => self.binary_arith(arithmetic::div),
            OpCode::Mod => self.binary_arith(arithmetic::modulo),
            OpCode::Negate => {
                let a = self.pop()?;
                self.stack.push(arithmetic::negate(a).into_value());
                Ok(Flow::Next)
            }

            OpCode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(arithmetic::equal(&a, &b)));
                Ok(Flow::Next)
            }
            OpCode::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(!arithmetic::equal(&a, &b)));
                Ok(Flow::Next)
            }
            OpCode::LessThan => self.compare_op(|o| o == CmpOrdering::Less),
            OpCode::GreaterThan => self.compare_op(|o| o == CmpOrdering::Greater),
            OpCode::LessEqual => self.compare_op(|o| o != CmpOrdering::Greater),
            OpCode::GreaterEqual => self.compare_op(|o| o != CmpOrdering::Less),

            OpCode::Not => {
                let a = self.pop()?;
                self.stack.push(Value::Bool(!a.is_truthy()));
                Ok(Flow::Next)
            }
            OpCode::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                Ok(Flow::Next)
            }
            OpCode::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                Ok(Flow::Next)
            }

            OpCode::Jump(target) => {
                self.ip = target;
                Ok(Flow::Jumped)
            }
            OpCode::JumpIfFalse(target) => {
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.ip = target;
                    Ok(Flow::Jumped)
                } else {
                    Ok(Flow::Next)
                }
            }
            OpCode::JumpIfTrue(target) => {
                let cond = self.pop()?;
                if cond.is_truthy() {
                    self.ip = target;
                    Ok(Flow::Jumped)
                } else {
                    Ok(Flow::Next)
                }
            }

            OpCode::InterpolateString(n) => {
                let mut parts = Vec::with_capacity(n);
                for _ in 0..n {
                    parts.push(self.pop()?);
                }
                parts.reverse();
                let joined: String = parts.iter().map(Value::to_display_string).collect();
                self.stack.push(Value::str(joined));
                Ok(Flow::Next)
            }

            OpCode::BeginFunction { name } => self.handle_begin_function(name),
            OpCode::EndFunction => Ok(Flow::Next),
            OpCode::DefineParam(_) | OpCode::DefineOptionalParam(_) | OpCode::SetDefaultValue | OpCode::MarkFallible => {
                Ok(Flow::Next)
            }
            OpCode::Return => self.handle_return(),
            OpCode::Call { name, argc } => self.handle_call(&name, argc),

            OpCode::BeginClass { name } => {
                self.classes.begin_class(name.clone());
                self.current_class = Some(name);
                Ok(Flow::Next)
            }
            OpCode::EndClass => {
                self.current_class = None;
                Ok(Flow::Next)
            }
            OpCode::DefineField(name) => {
                let default = self.pop()?;
                if let Some(class) = self.current_class.clone() {
                    self.classes.define_field(&class, name, default);
                }
                Ok(Flow::Next)
            }
            OpCode::SetSuperclass(name) => {
                if let Some(class) = self.current_class.clone() {
                    self.classes.set_superclass(&class, name);
                }
                Ok(Flow::Next)
            }

            OpCode::PushLambda(name) => {
                let sig = self
                    .functions
                    .get(&name)
                    .ok_or_else(|| self.fatal(ErrorKind::UndefinedFunction, format!("lambda '{name}' not registered")))?;
                self.stack.push(Value::Function {
                    name: sig.name.clone(),
                    start_address: sig.start_address,
                    end_address: sig.end_address,
                });
                Ok(Flow::Next)
            }
            OpCode::CaptureVar(name) => {
                let cell = environment::capture_cell(&self.environment, &name)
                    .ok_or_else(|| self.fatal(ErrorKind::UndefinedVariable, format!("undefined variable '{name}'")))?;
                self.stack.push(Value::tuple(vec![Value::str(name), Value::CaptureCell(cell)]));
                Ok(Flow::Next)
            }
            OpCode::CreateClosure(n) => self.handle_create_closure(n),

            OpCode::CheckError => {
                let top = self.stack.last().ok_or_else(|| self.fatal(ErrorKind::TypeError, "check_error on empty stack"))?;
                let is_error = matches!(top, Value::ErrorUnion(u) if u.is_error());
                self.stack.push(Value::Bool(is_error));
                Ok(Flow::Next)
            }
            OpCode::ConstructError { error_type, argc } => self.handle_construct_error(&error_type, argc),
            OpCode::ConstructOk => {
                let value = self.pop()?;
                self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::ok(value))));
                Ok(Flow::Next)
            }
            OpCode::IsError => {
                let v = self.pop()?;
                self.stack.push(Value::Bool(matches!(v, Value::ErrorUnion(u) if u.is_error())));
                Ok(Flow::Next)
            }
            OpCode::IsSuccess => {
                let v = self.pop()?;
                self.stack.push(Value::Bool(matches!(v, Value::ErrorUnion(u) if !u.is_error())));
                Ok(Flow::Next)
            }
            OpCode::UnwrapValue => self.handle_unwrap_value(),
            OpCode::PropagateError => {
                let top = self.pop()?;
                let error = match top {
                    Value::ErrorUnion(u) => match u.payload {
                        Ok(_) => return Err(self.fatal(ErrorKind::TypeError, "propagate_error on a success value")),
                        Err(e) => e,
                    },
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("propagate_error on non-error value {other:?}"))),
                };
                self.propagate_error(error).map(|_| Flow::Jumped)
            }
            OpCode::PushErrorFrame { handler_offset, expected_error_type } => {
                self.error_frames.push(ErrorFrame {
                    handler_address: handler_offset,
                    stack_base: self.stack.len(),
                    expected_error_type,
                    function_name: self.current_function_name(),
                });
                self.error_frame_pushes += 1;
                Ok(Flow::Next)
            }
            OpCode::PopErrorFrame => {
                self.error_frames.pop();
                Ok(Flow::Next)
            }

            OpCode::ImportModule(path) => {
                self.pending_import = Some(PendingImport { path, ..Default::default() });
                Ok(Flow::Next)
            }
            OpCode::ImportAlias(alias) => {
                if let Some(p) = &mut self.pending_import {
                    p.alias = Some(alias);
                }
                Ok(Flow::Next)
            }
            OpCode::ImportFilterShow(names) => {
                if let Some(p) = &mut self.pending_import {
                    p.show = Some(names);
                }
                Ok(Flow::Next)
            }
            OpCode::ImportFilterHide(names) => {
                if let Some(p) = &mut self.pending_import {
                    p.hide = Some(names);
                }
                Ok(Flow::Next)
            }
            OpCode::ImportAddIdentifier(name) => {
                if let Some(p) = &mut self.pending_import {
                    p.show.get_or_insert_with(Vec::new).push(name);
                }
                Ok(Flow::Next)
            }
            OpCode::ImportExecute => self.handle_import_execute(),
            OpCode::GetProperty(name) => self.handle_get_property(&name),
            OpCode::SetProperty(name) => self.handle_set_property(&name),

            OpCode::BuildList(n) => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.stack.push(Value::list(items));
                Ok(Flow::Next)
            }
            OpCode::BuildTuple(n) => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.stack.push(Value::tuple(items));
                Ok(Flow::Next)
            }
            OpCode::BuildDict(n) => {
                let mut flat = Vec::with_capacity(n * 2);
                for _ in 0..(n * 2) {
                    flat.push(self.pop()?);
                }
                flat.reverse();
                let pairs = flat.chunks(2).map(|pair| (pair[0].clone(), pair[1].clone())).collect();
                self.stack.push(Value::dict(pairs));
                Ok(Flow::Next)
            }
            OpCode::IndexGet => self.handle_index_get(),
            OpCode::IndexSet => self.handle_index_set(),

            OpCode::MakeIterator => {
                let container = self.pop()?;
                let elements = elements_of(&container)
                    .ok_or_else(|| self.fatal(ErrorKind::TypeError, format!("cannot iterate over {}", container.type_name())))?;
                self.stack.push(Value::iterator(elements));
                Ok(Flow::Next)
            }
            OpCode::IteratorHasNext => {
                let top = self.stack.last().ok_or_else(|| self.fatal(ErrorKind::TypeError, "empty stack"))?;
                let has_next = match top {
                    Value::Iterator(it) => it.lock().unwrap().has_next(),
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("{} is not an iterator", other.type_name()))),
                };
                self.stack.push(Value::Bool(has_next));
                Ok(Flow::Next)
            }
            OpCode::IteratorNext => {
                let top = self.stack.last().ok_or_else(|| self.fatal(ErrorKind::TypeError, "empty stack"))?;
                let value = match top {
                    Value::Iterator(it) => it.lock().unwrap().next().unwrap_or(Value::Nil),
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("{} is not an iterator", other.type_name()))),
                };
                self.stack.push(value);
                Ok(Flow::Next)
            }

            OpCode::MatchPattern => {
                let pattern_value = self.pop()?;
                let value = self.pop()?;
                let pattern = pattern::pattern_from_value(&pattern_value);
                match pattern::match_pattern(&pattern, &value) {
                    Some(bindings) => {
                        for (name, bound) in bindings {
                            environment::define_here(&self.environment, name, bound);
                        }
                        self.stack.push(Value::Bool(true));
                    }
                    None => self.stack.push(Value::Bool(false)),
                }
                Ok(Flow::Next)
            }

            OpCode::BeginParallel(params) => self.begin_block(params, false),
            OpCode::BeginConcurrent(params) => self.begin_block(params, true),
            OpCode::BeginTask(var) => {
                if let Some(block) = self.block_stack.last_mut() {
                    block.task_var = Some(var);
                }
                Ok(Flow::Next)
            }
            OpCode::StoreIterable => self.handle_store_iterable(),
            OpCode::EndTask => Ok(Flow::Next),
            OpCode::EndParallel => self.end_block(),
            OpCode::EndConcurrent => self.end_block(),

            OpCode::MakeAtomic => {
                let initial = self.pop()?;
                let n = match initial {
                    Value::Int(n, _) => n,
                    Value::UInt(n, _) => n as i64,
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("cannot make an atomic from {}", other.type_name()))),
                };
                self.stack.push(Value::Atomic(Arc::new(AtomicCell::new(n))));
                Ok(Flow::Next)
            }

            OpCode::Print => {
                let value = self.pop()?;
                println!("{}", value.to_display_string());
                Ok(Flow::Next)
            }
            OpCode::Halt => Ok(Flow::Halt),
        }
    }

    fn binary_arith(&mut self, op: fn(Value, Value) -> arithmetic::OpResult) -> Result<Flow, RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.stack.push(op(a, b).into_value());
        Ok(Flow::Next)
    }

    fn compare_op(&mut self, matches: fn(CmpOrdering) -> bool) -> Result<Flow, RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match arithmetic::compare(&a, &b) {
            Ok(ordering) => self.stack.push(Value::Bool(matches(ordering))),
            Err(e) => self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(e)))),
        }
        Ok(Flow::Next)
    }

    fn current_function_name(&self) -> String {
        self.call_stack.last().map(|f| f.function_name.clone()).unwrap_or_default()
    }

    fn handle_begin_function(&mut self, name: String) -> Result<Flow, RuntimeError> {
        let qualified = match &self.current_class {
            Some(class) => format!("{class}::{name}"),
            None => name.clone(),
        };
        let (sig, end) = scan_function(&self.bytecode, self.ip, qualified, name.starts_with("<lambda"));
        if let Some(class) = &self.current_class {
            self.classes.register_method(class, name);
        }
        self.functions.register(sig);
        self.ip = end;
        Ok(Flow::Next)
    }

    fn handle_return(&mut self) -> Result<Flow, RuntimeError> {
        let explicit_return = self.pop().unwrap_or(Value::Nil);
        let Some(frame) = self.call_stack.pop() else {
            // Permissive top-level no-op.
            self.stack.push(Value::Nil);
            return Ok(Flow::Next);
        };
        // A successful return discards the wildcard `ErrorFrame` this call
        // pushed on entry (if it was fallible) — it's scoped to this
        // activation and must not outlive it to catch some later, unrelated
        // error raised back in the caller.
        if frame.pushed_error_frame {
            self.error_frames.pop();
        }
        let return_value = if frame.function_name.ends_with("::init") {
            environment::lookup(&self.environment, "this").unwrap_or(Value::Nil)
        } else {
            explicit_return
        };
        self.environment = frame.previous_environment;
        self.ip = frame.return_address;
        self.return_count += 1;
        if self.return_count % CLOSURE_GC_RETURN_INTERVAL == 0 {
            self.run_closure_gc();
        }
        self.stack.push(return_value);
        Ok(Flow::Jumped)
    }

    fn handle_call(&mut self, name: &str, argc: usize) -> Result<Flow, RuntimeError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();

        // (1)/(2): a function or closure value sitting on top of the stack
        // (the higher-order call path).
        if matches!(self.stack.last(), Some(Value::Function { .. } | Value::Closure(_) | Value::ModuleFunction { .. })) {
            let callee = self.stack.pop().unwrap();
            return self.invoke_value(callee, args);
        }

        // (3): a local variable bound to a closure/function/module function.
        if let Some(value @ (Value::Closure(_) | Value::Function { .. } | Value::ModuleFunction { .. })) =
            environment::lookup(&self.environment, name)
        {
            return self.invoke_value(value, args);
        }

        // (4): constructor call.
        if self.classes.get(name).is_some() {
            return self.construct(name, args);
        }

        // (5): method protocol.
        if let Some(method_name) = name.strip_prefix("method:") {
            return self.call_method(method_name, args, false);
        }
        if let Some(method_name) = name.strip_prefix("super:") {
            return self.call_method(method_name, args, true);
        }

        // (6): user-defined function registry.
        if self.functions.contains(name) {
            return self.call_user_function(name, args, None);
        }

        // (7): native function registry.
        if self.natives.contains(name) {
            let result = self.natives.call(name, &args);
            return self.push_native_result(name, result);
        }

        Err(self.fatal(ErrorKind::UndefinedFunction, format!("undefined function '{name}'")))
    }

    fn invoke_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Flow, RuntimeError> {
        match callee {
            Value::Function { name, .. } => self.call_user_function(&name, args, None),
            Value::Closure(c) => self.call_closure(c, args),
            Value::ModuleFunction { module, name } => self.call_module_function(&module, &name, args),
            other => Err(self.fatal(ErrorKind::TypeError, format!("{} is not callable", other.type_name()))),
        }
    }

    fn push_native_result(&mut self, name: &str, result: Result<Value, ErrorValue>) -> Result<Flow, RuntimeError> {
        match result {
            Ok(v) => {
                self.stack.push(v);
                Ok(Flow::Next)
            }
            Err(e) if name == "assert" => Err(RuntimeError::from_unhandled(&e)),
            Err(e) => {
                self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(e))));
                Ok(Flow::Next)
            }
        }
    }

    /// Binds `args` against `sig`'s declared parameters into a fresh
    /// environment. Arity mismatches produce an error-union rather than a
    /// Rust error, following the
    /// same "structural failure -> value, not exception" discipline as
    /// `arithmetic.rs`.
    fn call_user_function(&mut self, name: &str, args: Vec<Value>, this: Option<Value>) -> Result<Flow, RuntimeError> {
        let Some(sig) = self.functions.get(name).cloned() else {
            return Err(self.fatal(ErrorKind::UndefinedFunction, format!("undefined function '{name}'")));
        };
        if args.len() < sig.required_count() || args.len() > sig.max_count() {
            let err = ErrorValue::new(
                "ArityError",
                format!("{name} expects {}..{} arguments, got {}", sig.required_count(), sig.max_count(), args.len()),
            );
            self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(err))));
            return Ok(Flow::Next);
        }
        let call_env = Environment::new_child(&self.globals);
        if let Some(this_val) = &this {
            environment::define_here(&call_env, "this", this_val.clone());
        }
        self.bind_parameters(&call_env, &sig, &args);
        self.call_stack.push(CallFrame {
            function_name: name.to_string(),
            return_address: self.ip + 1,
            previous_environment: self.environment.clone(),
            is_closure_call: false,
            closure_environment: None,
            pushed_error_frame: sig.is_fallible,
        });
        if sig.is_fallible {
            self.error_frames.push(ErrorFrame {
                handler_address: self.ip + 1,
                stack_base: self.stack.len(),
                expected_error_type: None,
                function_name: name.to_string(),
            });
            self.error_frame_pushes += 1;
        }
        self.environment = call_env;
        self.ip = find_body_start(&self.bytecode, sig.start_address);
        Ok(Flow::Jumped)
    }

    fn call_closure(&mut self, closure: Arc<Closure>, args: Vec<Value>) -> Result<Flow, RuntimeError> {
        let Some(sig) = self.functions.get(&closure.function_name).cloned() else {
            return Err(self.fatal(ErrorKind::UndefinedFunction, format!("undefined closure function '{}'", closure.function_name)));
        };
        if args.len() < sig.required_count() || args.len() > sig.max_count() {
            let err = ErrorValue::new(
                "ArityError",
                format!("{} expects {}..{} arguments, got {}", closure.function_name, sig.required_count(), sig.max_count(), args.len()),
            );
            self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(err))));
            return Ok(Flow::Next);
        }
        let call_env = Environment::new_closure_child(&self.globals, &closure.captured_environment);
        self.bind_parameters(&call_env, &sig, &args);
        self.call_stack.push(CallFrame {
            function_name: closure.function_name.clone(),
            return_address: self.ip + 1,
            previous_environment: self.environment.clone(),
            is_closure_call: true,
            closure_environment: Some(closure.captured_environment.clone()),
            pushed_error_frame: sig.is_fallible,
        });
        if sig.is_fallible {
            self.error_frames.push(ErrorFrame {
                handler_address: self.ip + 1,
                stack_base: self.stack.len(),
                expected_error_type: None,
                function_name: closure.function_name.clone(),
            });
            self.error_frame_pushes += 1;
        }
        self.environment = call_env;
        self.ip = find_body_start(&self.bytecode, closure.start_address);
        Ok(Flow::Jumped)
    }

    fn bind_parameters(&self, call_env: &EnvRef, sig: &crate::registry::FunctionSignature, args: &[Value]) {
        for (i, pname) in sig.parameters.iter().enumerate() {
            environment::define_here(call_env, pname.clone(), args[i].clone());
        }
        for (i, pname) in sig.optional_parameters.iter().enumerate() {
            let idx = sig.parameters.len() + i;
            let value = args
                .get(idx)
                .cloned()
                .unwrap_or_else(|| sig.default_values.get(pname).cloned().unwrap_or(Value::Nil));
            environment::define_here(call_env, pname.clone(), value);
        }
    }

    fn construct(&mut self, class_name: &str, args: Vec<Value>) -> Result<Flow, RuntimeError> {
        let class = self
            .classes
            .get(class_name)
            .cloned()
            .ok_or_else(|| self.fatal(ErrorKind::UndefinedFunction, format!("undefined class '{class_name}'")))?;
        let mut fields = HashMap::new();
        for (fname, fdefault) in &class.fields {
            fields.insert(fname.clone(), fdefault.clone());
        }
        let object = Value::Object(Arc::new(ObjectInstance { class_name: class_name.to_string(), fields: Arc::new(Mutex::new(fields)) }));
        let init_name = format!("{class_name}::init");
        if self.functions.contains(&init_name) {
            self.call_user_function(&init_name, args, Some(object))
        } else {
            self.stack.push(object);
            Ok(Flow::Next)
        }
    }

    fn call_method(&mut self, method_name: &str, mut args: Vec<Value>, is_super: bool) -> Result<Flow, RuntimeError> {
        let receiver = if matches!(self.stack.last(), Some(Value::Object(_))) {
            self.stack.pop().unwrap()
        } else if matches!(args.last(), Some(Value::Object(_))) {
            args.pop().unwrap()
        } else {
            return Err(self.fatal(ErrorKind::UndefinedMethod, format!("no receiver object for method '{method_name}'")));
        };
        let Value::Object(obj) = &receiver else { unreachable!() };
        let class_name = obj.class_name.clone();
        let qualified = if is_super {
            self.classes.resolve_super_method(&class_name, method_name)
        } else {
            self.classes.resolve_method(&class_name, method_name)
        }
        .ok_or_else(|| self.fatal(ErrorKind::UndefinedMethod, format!("undefined method '{method_name}' on '{class_name}'")))?;
        self.call_user_function(&qualified, args, Some(receiver))
    }

    /// Runs `name` inside `module` to completion synchronously and returns
    /// its result, since this crate keeps one `BytecodeChunk` per
    /// interpreter rather than splicing module bytecode into the caller's
    /// chunk.
    fn call_module_function(&mut self, module: &Arc<ModuleValue>, name: &str, args: Vec<Value>) -> Result<Flow, RuntimeError> {
        let module_env = Environment::new_child(&module.environment);
        let mut sub = self.child(Arc::clone(&module.bytecode), module_env);
        sub.functions = module.functions.clone();
        let Some(sig) = sub.functions.get(name).cloned() else {
            return Err(self.fatal(ErrorKind::UndefinedFunction, format!("module has no function '{name}'")));
        };
        let call_env = Environment::new_child(&sub.globals);
        sub.bind_parameters(&call_env, &sig, &args);
        sub.environment = call_env;
        let body_start = find_body_start(&sub.bytecode, sig.start_address);
        let end = sub.bytecode.instructions.len();
        let value = sub.run_from(body_start, end)?;
        self.stack.push(value);
        Ok(Flow::Next)
    }

    fn handle_create_closure(&mut self, n: usize) -> Result<Flow, RuntimeError> {
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            pairs.push(self.pop()?);
        }
        pairs.reverse();
        let func_value = self.pop()?;
        let Value::Function { name, start_address, end_address } = func_value else {
            return Err(self.fatal(ErrorKind::TypeError, "create_closure without a function on the stack"));
        };
        let captured_environment = Environment::new_child(&self.environment);
        let mut captured_names = Vec::with_capacity(n);
        for pair in &pairs {
            if let Value::Tuple(t) = pair {
                if let [Value::Str(cap_name), Value::CaptureCell(cell)] = &t[..] {
                    captured_environment.lock().unwrap().define_captured_cell(cap_name.to_string(), Arc::clone(cell));
                    captured_names.push(cap_name.to_string());
                }
            }
        }
        let closure = Arc::new(Closure {
            id: closures::next_closure_id(),
            function_name: name,
            start_address,
            end_address,
            captured_environment,
            captured_variable_names: captured_names,
        });
        self.closures.lock().unwrap().track(&closure);
        self.stack.push(Value::Closure(closure));
        Ok(Flow::Next)
    }

    fn handle_construct_error(&mut self, error_type: &str, argc: usize) -> Result<Flow, RuntimeError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let (message, arguments) = match args.split_first() {
            Some((Value::Str(s), rest)) => (s.to_string(), rest.to_vec()),
            _ => (String::new(), args),
        };
        let mut error = self.error_pool.lock().unwrap().acquire(error_type, &message, arguments);
        error.source_location = self.ip;
        self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(error))));
        Ok(Flow::Next)
    }

    fn handle_unwrap_value(&mut self) -> Result<Flow, RuntimeError> {
        let top = self.pop()?;
        match top {
            Value::ErrorUnion(u) => match u.payload {
                Ok(value) => {
                    self.stack.push(*value);
                    Ok(Flow::Next)
                }
                Err(error) => self.propagate_error(error).map(|_| Flow::Jumped),
            },
            other => Err(self.fatal(ErrorKind::TypeError, format!("unwrap_value on non-error-union {}", other.type_name()))),
        }
    }

    /// Walks the error-frame stack top to bottom. Assertion and
    /// contract violations are never caught here.
    fn propagate_error(&mut self, error: ErrorValue) -> Result<(), RuntimeError> {
        if error.is_always_fatal() {
            return Err(RuntimeError::from_unhandled(&error));
        }
        while let Some(frame) = self.error_frames.pop() {
            if frame.matches(&error.error_type) {
                self.stack.truncate(frame.stack_base);
                self.ip = frame.handler_address;
                self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(error))));
                return Ok(());
            }
        }
        Err(RuntimeError::from_unhandled(&error))
    }

    fn handle_import_execute(&mut self) -> Result<Flow, RuntimeError> {
        let pending = self
            .pending_import
            .take()
            .ok_or_else(|| self.fatal(ErrorKind::ImportFailure, "import_execute with no pending import"))?;
        let resolved_path = self.modules.lock().unwrap().resolve_path(&pending.path);
        let base = {
            let cached = self.modules.lock().unwrap().get_cached(&pending.path);
            match cached {
                Some(base) => base,
                None => {
                    self.modules.lock().unwrap().begin_loading(&pending.path)?;
                    let loaded = (|| -> Result<ModuleValue, RuntimeError> {
                        let chunk = crate::program::load_bytecode_file(&resolved_path).map_err(|e| {
                            RuntimeError::new(ErrorKind::ImportFailure, format!("{}: {e}", pending.path), SourceLocation::at(self.ip))
                        })?;
                        let module_env = Environment::new_child(&self.globals);
                        let mut sub = self.child(Arc::new(chunk), module_env.clone());
                        sub.execute()?;
                        let all_names = module_env.lock().unwrap().own_names();
                        Ok(ModuleValue {
                            name: module_basename(&pending.path),
                            environment: module_env,
                            bytecode: sub.bytecode,
                            functions: sub.functions,
                            visible_names: all_names,
                        })
                    })();
                    let module_value = match loaded {
                        Ok(module_value) => module_value,
                        Err(e) => {
                            // Loading failed after we claimed the slot on the loading
                            // stack: release it so a later, independent import attempt
                            // of the same path is not mistaken for a circular import.
                            self.modules.lock().unwrap().abandon_loading(&pending.path);
                            return Err(e);
                        }
                    };
                    self.modules.lock().unwrap().finish_loading(&pending.path, module_value)
                }
            }
        };
        let visible = module::apply_filter(&base.visible_names, pending.show.as_deref(), pending.hide.as_deref())?;
        let filtered = Arc::new(ModuleValue {
            name: base.name.clone(),
            environment: base.environment.clone(),
            bytecode: Arc::clone(&base.bytecode),
            functions: base.functions.clone(),
            visible_names: visible,
        });
        let bind_name = pending.alias.clone().unwrap_or_else(|| base.name.clone());
        environment::define_here(&self.environment, bind_name, Value::Module(filtered));
        Ok(Flow::Next)
    }

    fn handle_get_property(&mut self, name: &str) -> Result<Flow, RuntimeError> {
        let target = self.pop()?;
        match target {
            Value::Object(obj) => {
                let value = obj
                    .fields
                    .lock()
                    .unwrap()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.fatal(ErrorKind::UndefinedField, format!("undefined field '{name}'")))?;
                self.stack.push(value);
                Ok(Flow::Next)
            }
            Value::Module(module) => {
                if !module.visible_names.iter().any(|n| n == name) {
                    return Err(self.fatal(ErrorKind::UndefinedField, format!("module does not export '{name}'")));
                }
                let value = environment::lookup(&module.environment, name)
                    .ok_or_else(|| self.fatal(ErrorKind::UndefinedField, format!("undefined module member '{name}'")))?;
                if matches!(value, Value::Function { .. }) {
                    self.stack.push(Value::ModuleFunction { module, name: name.to_string() });
                } else {
                    self.stack.push(value);
                }
                Ok(Flow::Next)
            }
            other => Err(self.fatal(ErrorKind::UndefinedField, format!("cannot read property of {}", other.type_name()))),
        }
    }

    fn handle_set_property(&mut self, name: &str) -> Result<Flow, RuntimeError> {
        let value = self.pop()?;
        let target = self.pop()?;
        match target {
            Value::Object(obj) => {
                obj.fields.lock().unwrap().insert(name.to_string(), value);
                Ok(Flow::Next)
            }
            other => Err(self.fatal(ErrorKind::UndefinedField, format!("cannot set property on {}", other.type_name()))),
        }
    }

    fn handle_index_get(&mut self) -> Result<Flow, RuntimeError> {
        let index = self.pop()?;
        let container = self.pop()?;
        match index_get(&container, &index) {
            Ok(value) => self.stack.push(value),
            Err(e) => self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(e)))),
        }
        Ok(Flow::Next)
    }

    fn handle_index_set(&mut self) -> Result<Flow, RuntimeError> {
        let value = self.pop()?;
        let index = self.pop()?;
        let container = self.pop()?;
        match index_set(&container, &index, value) {
            Ok(()) => self.stack.push(Value::Nil),
            Err(e) => self.stack.push(Value::ErrorUnion(Box::new(ErrorUnion::err(e)))),
        }
        Ok(Flow::Next)
    }
}

fn store_into_atomic(cell: &Arc<AtomicCell>, value: &Value) {
    match value {
        Value::Int(n, _) => cell.store(*n),
        Value::UInt(n, _) => cell.store(*n as i64),
        _ => {}
    }
}

pub(crate) fn elements_of(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(l) => Some(l.lock().unwrap().clone()),
        Value::Tuple(t) => Some(t.as_ref().clone()),
        Value::Iterator(it) => {
            let mut it = it.lock().unwrap();
            let mut rest = Vec::new();
            while let Some(v) = it.next() {
                rest.push(v);
            }
            Some(rest)
        }
        _ => None,
    }
}

fn index_get(container: &Value, index: &Value) -> Result<Value, ErrorValue> {
    match container {
        Value::List(items) => {
            let items = items.lock().unwrap();
            let idx = index_to_usize(index, items.len())?;
            Ok(items[idx].clone())
        }
        Value::Tuple(items) => {
            let idx = index_to_usize(index, items.len())?;
            Ok(items[idx].clone())
        }
        Value::Dict(pairs) => {
            let pairs = pairs.lock().unwrap();
            pairs
                .iter()
                .find(|(k, _)| Value::values_equal(k, index))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| ErrorValue::new("KeyError", format!("key not found: {}", index.to_display_string())))
        }
        other => Err(ErrorValue::new("TypeError", format!("{} is not indexable", other.type_name()))),
    }
}

fn index_set(container: &Value, index: &Value, value: Value) -> Result<(), ErrorValue> {
    match container {
        Value::List(items) => {
            let mut items = items.lock().unwrap();
            let idx = index_to_usize(index, items.len())?;
            items[idx] = value;
            Ok(())
        }
        Value::Dict(pairs) => {
            let mut pairs = pairs.lock().unwrap();
            if let Some(entry) = pairs.iter_mut().find(|(k, _)| Value::values_equal(k, index)) {
                entry.1 = value;
            } else {
                pairs.push((index.clone(), value));
            }
            Ok(())
        }
        other => Err(ErrorValue::new("TypeError", format!("{} does not support index assignment", other.type_name()))),
    }
}

fn index_to_usize(index: &Value, len: usize) -> Result<usize, ErrorValue> {
    let i = match index {
        Value::Int(n, _) => *n,
        Value::UInt(n, _) => *n as i64,
        other => return Err(ErrorValue::new("TypeError", format!("index must be an integer, got {}", other.type_name()))),
    };
    if i < 0 || i as usize >= len {
        return Err(ErrorValue::new("IndexOutOfBounds", format!("index {i} out of bounds for length {len}")));
    }
    Ok(i as usize)
}

fn module_basename(path: &str) -> String {
    path.rsplit('.').next().unwrap_or(path).to_string()
}

/// Scans a function body starting at `start` (the `BeginFunction` index),
/// recording its parameter lists and fallibility and finding its matching
/// `EndFunction`, tracking nesting depth for functions defined inside it.
/// Also used for top-level functions at `BeginFunction` execution time.
fn scan_function(
    chunk: &BytecodeChunk,
    start: usize,
    name: String,
    is_lambda: bool,
) -> (crate::registry::FunctionSignature, usize) {
    let instrs = &chunk.instructions;
    let mut parameters = Vec::new();
    let mut optional_parameters = Vec::new();
    let mut default_values = HashMap::new();
    let mut is_fallible = false;
    let mut last_optional: Option<String> = None;
    let mut depth = 1;
    let mut i = start + 1;
    while i < instrs.len() && depth > 0 {
        match &instrs[i].opcode {
            OpCode::BeginFunction { .. } => depth += 1,
            OpCode::EndFunction => depth -= 1,
            OpCode::DefineParam(p) if depth == 1 => parameters.push(p.clone()),
            OpCode::DefineOptionalParam(p) if depth == 1 => {
                optional_parameters.push(p.clone());
                last_optional = Some(p.clone());
            }
            OpCode::SetDefaultValue if depth == 1 => {
                if let Some(name) = &last_optional {
                    if i > 0 {
                        if let OpCode::LoadConst(idx) = &instrs[i - 1].opcode {
                            if let Some(constant) = chunk.constants.get(*idx) {
                                default_values.insert(name.clone(), constant.to_value());
                            }
                        }
                    }
                }
            }
            OpCode::MarkFallible if depth == 1 => is_fallible = true,
            _ => {}
        }
        i += 1;
    }
    let end_address = i.saturating_sub(1);
    (
        crate::registry::FunctionSignature {
            name,
            parameters,
            optional_parameters,
            default_values,
            start_address: start,
            end_address,
            is_lambda,
            is_fallible,
        },
        end_address,
    )
}

/// Computes the first "real body" instruction of a function starting at
/// `start_address` (its `BeginFunction`): skips parameter-definition
/// opcodes and any nested lambda definitions, tracking nesting depth (spec
/// §4.5 "Closure call").
fn find_body_start(chunk: &BytecodeChunk, start_address: usize) -> usize {
    let instrs = &chunk.instructions;
    let mut i = start_address + 1;
    loop {
        match instrs.get(i).map(|ins| &ins.opcode) {
            Some(OpCode::DefineParam(_))
            | Some(OpCode::DefineOptionalParam(_))
            | Some(OpCode::SetDefaultValue)
            | Some(OpCode::MarkFallible) => {
                i += 1;
            }
            Some(OpCode::BeginFunction { .. }) => {
                let mut depth = 1;
                i += 1;
                while depth > 0 && i < instrs.len() {
                    match &instrs[i].opcode {
                        OpCode::BeginFunction { .. } => depth += 1,
                        OpCode::EndFunction => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => break,
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Instruction};
    use crate::natives;

    fn interp(instructions: Vec<Instruction>, constants: Vec<Constant>) -> Interpreter {
        let mut natives = NativeRegistry::new();
        natives::install_default_natives(&mut natives);
        Interpreter::new(Arc::new(BytecodeChunk::new(instructions, constants)), natives, 2)
    }

    #[test]
    fn division_by_zero_is_recoverable_via_check_error() {
        // push 10, push 0, DIVIDE, CHECK_ERROR, JUMP_IF_FALSE +3, push -1, RETURN, push result, RETURN
        let code = vec![
            Instruction::new(OpCode::LoadConst(0), 1),
            Instruction::new(OpCode::LoadConst(1), 1),
            Instruction::new(OpCode::Div, 1),
            Instruction::new(OpCode::CheckError, 1),
            Instruction::new(OpCode::JumpIfFalse(7), 1),
            Instruction::new(OpCode::LoadConst(2), 1),
            Instruction::new(OpCode::Halt, 1),
            Instruction::new(OpCode::Halt, 1),
        ];
        let constants = vec![Constant::Int(10, IntWidth::I64), Constant::Int(0, IntWidth::I64), Constant::Int(-1, IntWidth::I64)];
        let mut vm = interp(code, constants);
        let result = vm.execute().unwrap();
        assert!(matches!(result, Value::Int(-1, _)));
    }

    #[test]
    fn fibonacci_via_recursion() {
        // fib(n): if n < 2 return n else return fib(n-1) + fib(n-2)
        use OpCode::*;
        let code = vec![
            /*0*/ Instruction::new(BeginFunction { name: "fib".into() }, 1),
            /*1*/ Instruction::new(DefineParam("n".into()), 1),
            /*2*/ Instruction::new(LoadVar("n".into()), 1),
            /*3*/ Instruction::new(LoadConst(0), 1),
            /*4*/ Instruction::new(LessThan, 1),
            /*5*/ Instruction::new(JumpIfFalse(8), 1),
            /*6*/ Instruction::new(LoadVar("n".into()), 1),
            /*7*/ Instruction::new(Return, 1),
            /*8*/ Instruction::new(LoadVar("n".into()), 1),
            /*9*/ Instruction::new(LoadConst(1), 1),
            /*10*/ Instruction::new(Sub, 1),
            /*11*/ Instruction::new(Call { name: "fib".into(), argc: 1 }, 1),
            /*12*/ Instruction::new(LoadVar("n".into()), 1),
            /*13*/ Instruction::new(LoadConst(2), 1),
            /*14*/ Instruction::new(Sub, 1),
            /*15*/ Instruction::new(Call { name: "fib".into(), argc: 1 }, 1),
            /*16*/ Instruction::new(Add, 1),
            /*17*/ Instruction::new(Return, 1),
            /*18*/ Instruction::new(EndFunction, 1),
            /*19*/ Instruction::new(LoadConst(3), 1),
            /*20*/ Instruction::new(Call { name: "fib".into(), argc: 1 }, 1),
            /*21*/ Instruction::new(Halt, 1),
        ];
        let constants = vec![Constant::Int(2, IntWidth::I64), Constant::Int(1, IntWidth::I64), Constant::Int(2, IntWidth::I64), Constant::Int(10, IntWidth::I64)];
        let mut vm = interp(code, constants);
        let result = vm.execute().unwrap();
        assert!(matches!(result, Value::Int(55, _)), "expected 55, got {result:?}");
    }

    #[test]
    fn undefined_variable_is_fatal() {
        let code = vec![Instruction::new(OpCode::LoadVar("missing".into()), 1)];
        let mut vm = interp(code, vec![]);
        let err = vm.execute().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedVariable);
    }

    #[test]
    fn construct_error_then_propagate_is_caught_by_a_wildcard_frame() {
        use OpCode::*;
        let code = vec![
            /*0*/ Instruction::new(PushErrorFrame { handler_offset: 3, expected_error_type: None }, 1),
            /*1*/ Instruction::new(ConstructError { error_type: "ValueError".into(), argc: 1 }, 1),
            /*2*/ Instruction::new(PropagateError, 1),
            /*3*/ Instruction::new(IsError, 1),
            /*4*/ Instruction::new(Halt, 1),
        ];
        let constants = vec![Constant::Str("bad".into())];
        let code_with_push = {
            let mut c = vec![Instruction::new(LoadConst(0), 1)];
            c.extend(code);
            c
        };
        let mut vm = interp(code_with_push, constants);
        let result = vm.execute().unwrap();
        assert!(matches!(result, Value::Bool(true)));
    }

    #[test]
    fn assertion_failure_is_always_fatal_even_under_a_wildcard_frame() {
        use OpCode::*;
        let code = vec![
            Instruction::new(LoadConst(0), 1),
            Instruction::new(PushErrorFrame { handler_offset: 4, expected_error_type: None }, 1),
            Instruction::new(ConstructError { error_type: "AssertionError".into(), argc: 1 }, 1),
            Instruction::new(PropagateError, 1),
            Instruction::new(Halt, 1),
        ];
        let constants = vec![Constant::Str("Assertion failed: x > 0".into())];
        let mut vm = interp(code, constants);
        let err = vm.execute().unwrap_err();
        assert_eq!(err.kind, ErrorKind::AssertionFailure);
    }

    #[test]
    fn construct_ok_then_unwrap_returns_the_original_value() {
        use OpCode::*;
        let code = vec![
            Instruction::new(LoadConst(0), 1),
            Instruction::new(ConstructOk, 1),
            Instruction::new(UnwrapValue, 1),
            Instruction::new(Halt, 1),
        ];
        let constants = vec![Constant::Int(42, IntWidth::I64)];
        let mut vm = interp(code, constants);
        let result = vm.execute().unwrap();
        assert!(matches!(result, Value::Int(42, _)));
    }

    #[test]
    fn list_index_out_of_bounds_is_an_error_union_not_fatal() {
        use OpCode::*;
        let code = vec![
            Instruction::new(LoadConst(0), 1),
            Instruction::new(LoadConst(1), 1),
            Instruction::new(LoadConst(2), 1),
            Instruction::new(BuildList(2), 1),
            Instruction::new(LoadConst(3), 1),
            Instruction::new(IndexGet, 1),
            Instruction::new(Halt, 1),
        ];
        let constants = vec![Constant::Int(10, IntWidth::I64), Constant::Int(20, IntWidth::I64), Constant::Int(0, IntWidth::I64) /* unused */, Constant::Int(5, IntWidth::I64)];
        let mut vm = interp(code, constants);
        let result = vm.execute().unwrap();
        match result {
            Value::ErrorUnion(u) => assert_eq!(u.payload.unwrap_err().error_type, "IndexOutOfBounds"),
            other => panic!("expected error union, got {other:?}"),
        }
    }
}
