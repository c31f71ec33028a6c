//! Init-time tuning constants (spec §6).
//!
//! These are never fetched remotely — the core makes no network calls — but
//! a host application may still want to override them at startup (e.g. a
//! lower `QUANTUM_ITERATIONS` on a low-power device), so they live behind a
//! plain struct with `Default` rather than bare `const`s.

#[cfg(feature = "config-toml")]
use serde::Deserialize;

/// Debounce window, in milliseconds, collapsing a burst of parameter/zoom
/// events into a single dispatch.
pub const DEBOUNCE_MS_DEFAULT: u64 = 30;
/// Iterations per solve quantum.
pub const QUANTUM_ITERATIONS_DEFAULT: u32 = 200;
/// Inner-loop iterations between cancellation checks.
pub const BATCH_SIZE_DEFAULT: u32 = 32;
/// Upper bound on worker count, independent of `hardware_concurrency`.
pub const DEFAULT_POOL_SIZE_CAP_DEFAULT: usize = 4;
/// Multiplier applied to `tau_decay` when deriving window padding.
pub const PADDING_TAU_MULTIPLIER_DEFAULT: f64 = 5.0;
/// Absolute cap on window padding, in seconds.
pub const MAX_PADDING_SECONDS_DEFAULT: f64 = 300.0;
/// Relative tau change, at or above which warm-start classification falls
/// back to `Cold`.
pub const TAU_CHANGE_THRESHOLD_DEFAULT: f64 = 0.20;
/// FISTA relative-objective-change stopping criterion.
pub const CONVERGENCE_TOLERANCE_DEFAULT: f64 = 1e-5;

/// Collected tuning constants for one [`crate::manager::CellSolveManager`] /
/// [`crate::pool::WorkerPool`] instance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "config-toml", derive(Deserialize))]
#[cfg_attr(feature = "config-toml", serde(default))]
pub struct CoreConfig {
    pub debounce_ms: u64,
    pub quantum_iterations: u32,
    pub batch_size: u32,
    pub pool_size_cap: usize,
    pub padding_tau_multiplier: f64,
    pub max_padding_seconds: f64,
    pub tau_change_threshold: f64,
    pub convergence_tolerance: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            debounce_ms: DEBOUNCE_MS_DEFAULT,
            quantum_iterations: QUANTUM_ITERATIONS_DEFAULT,
            batch_size: BATCH_SIZE_DEFAULT,
            pool_size_cap: DEFAULT_POOL_SIZE_CAP_DEFAULT,
            padding_tau_multiplier: PADDING_TAU_MULTIPLIER_DEFAULT,
            max_padding_seconds: MAX_PADDING_SECONDS_DEFAULT,
            tau_change_threshold: TAU_CHANGE_THRESHOLD_DEFAULT,
            convergence_tolerance: CONVERGENCE_TOLERANCE_DEFAULT,
        }
    }
}

impl CoreConfig {
    #[cfg(feature = "config-toml")]
    /// Parse overrides from a TOML document. Missing fields fall back to
    /// `Default::default()`. Never reads from disk or network itself —
    /// callers own how the string was obtained.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
