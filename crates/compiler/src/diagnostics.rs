//! Compile-time diagnostics and panic-mode recovery (§4.3, §7).

use crate::lexer::Pos;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub pos: Pos,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ERROR] {} at {}:{}",
            self.message, self.pos.line, self.pos.column
        )
    }
}

/// Accumulates diagnostics and tracks panic-mode so a single malformed
/// construct doesn't cascade into a screen of follow-on errors.
#[derive(Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
    panicking: bool,
}

impl DiagnosticSink {
    pub fn new() -> DiagnosticSink {
        DiagnosticSink::default()
    }

    pub fn error_at(&mut self, pos: Pos, message: impl Into<String>) {
        if self.panicking {
            return;
        }
        self.panicking = true;
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            pos,
        });
    }

    pub fn had_error(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn is_panicking(&self) -> bool {
        self.panicking
    }

    pub fn clear_panic(&mut self) {
        self.panicking = false;
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
