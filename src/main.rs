// File: src/main.rs
//
// Command-line entry point. The crate has no front end of its own (spec
// §1), so `run` loads a JSON-encoded `BytecodeChunk` — the wire format a
// front end would emit — rather than a source file, the way the teacher's
// `main.rs` dispatches subcommands via `clap` and hands off to the VM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};

use strandvm::interpreter::Interpreter;
use strandvm::natives::{install_default_natives, NativeRegistry};
use strandvm::program;

#[derive(ClapParser)]
#[command(
    name = "strand",
    about = "Strand: a stack-based bytecode VM with an integrated concurrency runtime",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Execute a JSON-encoded bytecode chunk
    Run {
        /// Path to the .json bytecode file
        file: PathBuf,

        /// Number of worker threads in the concurrency pool (default: number of CPUs)
        #[arg(long)]
        workers: Option<usize>,

        /// Print error-pool, error-frame, and closure-tracker counters after execution
        #[arg(long)]
        stats: bool,
    },

    /// Print the decoded instruction stream of a bytecode file
    Disasm {
        /// Path to the .json bytecode file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, workers, stats } => run(&file, workers, stats),
        Commands::Disasm { file } => disasm(&file),
    }
}

fn run(file: &PathBuf, workers: Option<usize>, stats: bool) -> ExitCode {
    let chunk = match program::load_bytecode_file(file) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let worker_count = workers.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));

    let mut natives = NativeRegistry::new();
    install_default_natives(&mut natives);

    let mut interpreter = Interpreter::new(Arc::new(chunk), natives, worker_count);
    let result = interpreter.execute();
    if stats {
        print_stats(&interpreter);
    }
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn print_stats(interpreter: &Interpreter) {
    use colored::Colorize;
    let (hits, misses) = interpreter.error_pool_stats();
    let (active_closures, shared_vars) = interpreter.closure_tracker_stats();
    eprintln!("{}", "-- stats --".dimmed());
    eprintln!("error frame pushes:   {}", interpreter.error_frame_pushes());
    eprintln!("error pool hits/miss: {hits}/{misses}");
    eprintln!("active closures:      {active_closures}");
    eprintln!("shared capture cells: {shared_vars}");
}

fn disasm(file: &PathBuf) -> ExitCode {
    match program::load_bytecode_file(file) {
        Ok(chunk) => {
            for (i, inst) in chunk.instructions.iter().enumerate() {
                println!("{i:>5}  {inst}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
