//! Error taxonomy for the compute core (spec §7).
//!
//! Stale callbacks and cancellation are deliberately *not* represented here:
//! they are ordinary [`crate::job::WorkerMessage`] variants, not failures.

use thiserror::Error;

/// Failures detected before a job ever reaches a worker.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidInput {
    #[error("tau_rise ({tau_rise}) must be strictly less than tau_decay ({tau_decay})")]
    TauOrdering { tau_rise: f64, tau_decay: f64 },
    #[error("tau_rise must be positive, got {0}")]
    NonPositiveTauRise(f64),
    #[error("lambda must be non-negative, got {0}")]
    NegativeLambda(f64),
    #[error("fs must be positive, got {0}")]
    NonPositiveFs(f64),
    #[error("trace must be non-empty")]
    EmptyTrace,
    #[error("trace contains a non-finite value at index {0}")]
    NonFiniteSample(usize),
    #[error("warm_strategy requires warm_state, but none was provided")]
    MissingWarmState,
    #[error("warm_state length fingerprint does not match trace length")]
    WarmStateLengthMismatch,
    #[error("warm_state kernel fingerprint does not match current tau_rise/tau_decay/fs")]
    WarmStateKernelMismatch,
}

/// Failures detected while a solve is running inside a worker.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("solver diverged: non-finite value produced at iteration {iteration}")]
    Divergence { iteration: u32 },
}

/// Top-level error type surfaced across the pool/manager boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),
    #[error("solve failed: {0}")]
    Solve(#[from] SolveError),
    #[error("worker {worker_id} terminated unexpectedly: {message}")]
    WorkerFatal { worker_id: usize, message: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
