//! Ember Runtime: garbage-collected heap, coroutine scheduler, epoll I/O
//! layer, and built-in natives sitting underneath the bytecode dispatch
//! loop.
//!
//! [`run_source`] is the single entry point embedders (the CLI, the REPL)
//! need: compile, then drive the VM to completion, folding both the
//! compiler's and the VM's error types into one [`EmberError`] so exit-code
//! mapping lives in one place.

pub mod config;
pub mod coroutine;
pub mod error;
pub mod heap;
pub mod io;
pub mod natives;
pub mod vm;

pub use config::Config;
pub use error::{FatalError, InterpretError, RuntimeError, TraceFrame};
pub use vm::Vm;

use ember_core::Value;

/// Everything that can go wrong between handing `run_source` a string and
/// getting a `Value` back: a compile-time diagnostic batch, a runtime
/// error with a trace, or a fatal (allocation/internal) failure.
#[derive(Debug)]
pub enum EmberError {
    Compile(ember_compiler::CompileError),
    Runtime(RuntimeError),
    Fatal(FatalError),
}

impl std::fmt::Display for EmberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmberError::Compile(e) => write!(f, "{e}"),
            EmberError::Runtime(e) => write!(f, "{e}"),
            EmberError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EmberError {}

impl From<ember_compiler::CompileError> for EmberError {
    fn from(e: ember_compiler::CompileError) -> EmberError {
        EmberError::Compile(e)
    }
}

impl From<InterpretError> for EmberError {
    fn from(e: InterpretError) -> EmberError {
        match e {
            InterpretError::Runtime(e) => EmberError::Runtime(e),
            InterpretError::Fatal(e) => EmberError::Fatal(e),
        }
    }
}

impl EmberError {
    /// Exit code the CLI reports for this failure (§6): 65 for a compile
    /// error (`EX_DATAERR`), 70 for a fatal error (`EX_SOFTWARE`), 1 for an
    /// ordinary unhandled runtime error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EmberError::Compile(_) => 65,
            EmberError::Fatal(_) => 70,
            EmberError::Runtime(_) => 1,
        }
    }
}

/// Compiles `source` and runs it to completion on a fresh [`Vm`], draining
/// every coroutine, timer, and I/O registration it spawns before
/// returning.
pub fn run_source(source: &str, config: Config) -> Result<Value, EmberError> {
    let mut vm = Vm::new(config).map_err(EmberError::Fatal)?;
    let script = ember_compiler::compile_source(source, &mut vm.heap)?;
    vm.run(script).map_err(EmberError::from)
}
