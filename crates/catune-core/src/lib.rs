//! `catune-core`: the interactive calcium-imaging deconvolution compute
//! core. A FISTA solver kernel, overlap-and-discard windowing with a
//! per-cell warm-start cache, a priority-aware cancellable worker pool, and
//! a reactive orchestrator tying them to UI-facing selection/parameter/zoom
//! signals.
//!
//! Adapted from the teacher's `wasm_bindgen` solver crate: the numerical
//! core keeps the same buffer layout and kernel math, generalized off the
//! single-threaded WASM/JS driving model onto a native thread pool driven
//! by [`manager::CellSolveManager`].

pub mod config;
pub mod debounce;
pub mod error;
pub mod fft;
pub mod filter;
pub mod job;
pub mod kernel;
pub mod manager;
pub mod params;
pub mod pool;
pub mod solver;
pub mod window;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, InvalidInput, SolveError};
pub use job::{Job, JobId, Priority, PriorityFn, WorkerMessage};
pub use manager::{CellPriorityBand, CellSolveManager, CellStatus, CellView, Dataset};
pub use params::SolverParams;
pub use pool::WorkerPool;
pub use solver::{Solver, StateBlob, StepOutcome};
pub use window::{compute_padded_window, classify_strategy, PaddedWindow, WarmStartCache, WarmStartStrategy};
