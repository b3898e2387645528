//! Ember Compiler: lexer, diagnostics, and the single-pass Pratt compiler
//! that turns source text directly into bytecode against an
//! [`ember_core::Allocator`] supplied by the embedding runtime.

mod compiler;
pub mod diagnostics;
pub mod lexer;
pub mod precedence;

pub use compiler::{compile, FnKind};
pub use diagnostics::Diagnostic;

use ember_core::Allocator;

/// Compile error surfaced to callers: one or more diagnostics collected
/// during a single compilation (panic-mode recovery means a source file
/// with several mistakes reports more than one).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in &self.diagnostics {
            writeln!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Compiles `source` into the root script function, tracing the outcome
/// the way the runtime traces VM-level events.
pub fn compile_source(
    source: &str,
    alloc: &mut dyn Allocator,
) -> Result<ember_core::ObjRef, CompileError> {
    match compile(source, alloc) {
        Ok(function) => {
            tracing::debug!("compiled {} bytes of source", source.len());
            Ok(function)
        }
        Err(diagnostics) => {
            tracing::warn!(count = diagnostics.len(), "compilation failed");
            Err(CompileError { diagnostics })
        }
    }
}
