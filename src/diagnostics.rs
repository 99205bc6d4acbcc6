//! Structured diagnostics emitted during assembly and solve.
//!
//! The engine reports to whatever [`DiagnosticSink`] it was given.
//! [`TracingSink`] forwards to `tracing`; [`RecordingSink`] keeps the events
//! for inspection.

use std::cell::RefCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// One source has been added to the design matrix.
    SourceAssembled {
        source: usize,
        pixels: usize,
        rejected: usize,
        derivative_terms: usize,
    },
    /// The sparse system about to be solved.
    MatrixShape {
        rows: usize,
        columns: usize,
        entries: usize,
    },
    SolveFinished {
        iterations: usize,
        residual: f64,
        converged: bool,
    },
}

pub trait DiagnosticSink {
    fn record(&self, diagnostic: &Diagnostic);
}

/// Default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

pub static TRACING_SINK: TracingSink = TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        match *diagnostic {
            Diagnostic::SourceAssembled { source, pixels, rejected, derivative_terms } => {
                debug!(source, pixels, rejected, derivative_terms, "source assembled");
            }
            Diagnostic::MatrixShape { rows, columns, entries } => {
                info!("parameter matrix size {} rows, {} cols, {} entries", rows, columns, entries);
            }
            Diagnostic::SolveFinished { iterations, residual, converged: true } => {
                info!(iterations, residual, "least-squares solve converged");
            }
            Diagnostic::SolveFinished { iterations, residual, converged: false } => {
                warn!(iterations, residual, "least-squares solve hit the iteration cap");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: RefCell<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        self.events.borrow_mut().push(diagnostic.clone());
    }
}
