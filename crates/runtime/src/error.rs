//! Runtime error types (§7).

use std::fmt;

/// A single active call frame's contribution to a stack trace: function
/// name and the source location of the last-executed instruction.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function_name: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} ({}:{})", self.function_name, self.line, self.column)
    }
}

/// An ordinary runtime error (§7 "Runtime" kind): type mismatches, unknown
/// names, bad indices, and the like. Carries the call-stack trace captured
/// at the point of failure.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> RuntimeError {
        self.trace = trace;
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runtime error: {}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<String> for RuntimeError {
    fn from(message: String) -> RuntimeError {
        RuntimeError::new(message)
    }
}

impl From<&str> for RuntimeError {
    fn from(message: &str) -> RuntimeError {
        RuntimeError::new(message)
    }
}

/// A §7 "Fatal" error: allocation failure or an internal invariant
/// violation. Distinct from [`RuntimeError`] because the CLI reports it
/// with a different exit code (70, `EX_SOFTWARE`) per the original
/// implementation's `abort()` paths.
#[derive(Debug, Clone)]
pub struct FatalError(pub String);

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.0)
    }
}

impl std::error::Error for FatalError {}

/// What a completed interpretation produced — threaded through from the
/// VM's dispatch loop up to the CLI's exit-code mapping (§6).
#[derive(Debug)]
pub enum InterpretError {
    Runtime(RuntimeError),
    Fatal(FatalError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Runtime(e) => write!(f, "{e}"),
            InterpretError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> InterpretError {
        InterpretError::Runtime(e)
    }
}

impl From<FatalError> for InterpretError {
    fn from(e: FatalError) -> InterpretError {
        InterpretError::Fatal(e)
    }
}
