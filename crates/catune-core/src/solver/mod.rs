//! Single-cell FISTA deconvolution kernel (spec §4.1).
//!
//! Adapted from the teacher's `wasm_bindgen`-annotated `Solver`
//! (`wasm/catune-solver/src/lib.rs`): same buffer layout and lazy
//! reconvolution, generalized to a plain native struct driven by the
//! worker pool instead of JS, with cancellation and a primal-residual
//! convergence test pulled from the CaLab lineage
//! (`crates-solver-src-fista.rs`) in place of the objective-based one.

mod fista;
pub(crate) mod state;

use crate::error::{CoreResult, InvalidInput, SolveError};
use crate::fft::FftConvolver;
use crate::filter::BandpassFilter;
use crate::kernel::{build_kernel, compute_lipschitz};
use crate::params::SolverParams;
use crate::window::WarmStartStrategy;

pub use state::StateBlob;

/// Below this length, direct time-domain convolution beats the fixed
/// overhead of an FFT round-trip (spec §4.1 "Convolution dispatch").
pub(crate) const FFT_THRESHOLD: usize = 4096;

/// Convergence tolerance on the relative change of the primal iterate
/// between successive FISTA steps (spec §8, "relative change in s").
const DEFAULT_TOLERANCE: f64 = crate::config::CONVERGENCE_TOLERANCE_DEFAULT;

/// Outcome of a bounded batch of FISTA iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Ran the full batch, solver has not yet converged.
    Progressed,
    /// Relative change in the iterate fell below tolerance.
    Converged,
    /// A non-finite value appeared in the iterate.
    Diverged,
}

/// The per-cell deconvolution solver. One instance lives on a worker thread
/// for the lifetime of a job; it is moved, never shared, across threads
/// (spec §5, "ownership transfer, not shared memory").
pub struct Solver {
    params: SolverParams,

    trace: Vec<f32>,
    filtered_trace: Vec<f32>,
    active_len: usize,

    kernel: Vec<f32>,
    kernel_dc_gain: f64,
    lipschitz_constant: f64,

    solution: Vec<f32>,
    solution_prev: Vec<f32>,
    gradient: Vec<f32>,
    reconvolution: Vec<f32>,
    residual_buf: Vec<f32>,

    baseline: f64,
    iteration: u32,
    t_fista: f64,
    converged: bool,
    tolerance: f64,

    reconvolution_stale: bool,
    fft: FftConvolver,
    bandpass: BandpassFilter,
}

impl Solver {
    pub fn new(params: SolverParams) -> CoreResult<Self> {
        params.validate()?;

        let kernel = build_kernel(&params);
        let lipschitz_constant = compute_lipschitz(&kernel);
        let kernel_dc_gain = kernel.iter().map(|&v| v as f64).sum();

        let mut bandpass = BandpassFilter::new();
        bandpass.set_enabled(params.filter_enabled);
        bandpass.update_cutoffs(params.tau_rise_s, params.tau_decay_s, params.fs);

        Ok(Solver {
            params,
            trace: Vec::new(),
            filtered_trace: Vec::new(),
            active_len: 0,
            kernel,
            kernel_dc_gain,
            lipschitz_constant,
            solution: Vec::new(),
            solution_prev: Vec::new(),
            gradient: Vec::new(),
            reconvolution: Vec::new(),
            residual_buf: Vec::new(),
            baseline: 0.0,
            iteration: 0,
            t_fista: 1.0,
            converged: false,
            tolerance: DEFAULT_TOLERANCE,
            reconvolution_stale: true,
            fft: FftConvolver::new(),
            bandpass,
        })
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn solution(&self) -> &[f32] {
        &self.solution[..self.active_len]
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    /// The trace actually fed to FISTA: bandpass-filtered when
    /// `filter_enabled`, raw otherwise (spec §4.1 "filtered trace replaces
    /// `y` in the objective").
    pub fn filtered_trace(&self) -> &[f32] {
        &self.filtered_trace[..self.active_len]
    }

    /// Replace the params in-place, rebuilding the kernel and Lipschitz
    /// estimate. Does not reset FISTA state; callers decide a warm-start
    /// strategy separately (spec §4.2) and call [`Solver::reset_momentum`]
    /// or [`Solver::cold_start`] as needed.
    pub fn set_params(&mut self, params: SolverParams) -> Result<(), InvalidInput> {
        params.validate()?;
        let kernel_changed = params.tau_rise_s != self.params.tau_rise_s || params.tau_decay_s != self.params.tau_decay_s;
        self.params = params;

        if kernel_changed {
            self.kernel = build_kernel(&self.params);
            self.lipschitz_constant = compute_lipschitz(&self.kernel);
            self.kernel_dc_gain = self.kernel.iter().map(|&v| v as f64).sum();
            self.fft.invalidate();
            self.bandpass.update_cutoffs(self.params.tau_rise_s, self.params.tau_decay_s, self.params.fs);
        }
        self.bandpass.set_enabled(self.params.filter_enabled);
        self.reconvolution_stale = true;
        Ok(())
    }

    /// Load a new trace window. Always starts from a grown (never shrunk)
    /// buffer layout, matching the teacher's allocation discipline.
    pub fn set_trace(&mut self, trace: &[f32]) -> Result<(), InvalidInput> {
        if trace.is_empty() {
            return Err(InvalidInput::EmptyTrace);
        }
        for (i, &v) in trace.iter().enumerate() {
            if !v.is_finite() {
                return Err(InvalidInput::NonFiniteSample(i));
            }
        }

        let n = trace.len();
        self.grow_buffers(n);
        self.trace[..n].copy_from_slice(trace);
        self.active_len = n;

        self.filtered_trace[..n].copy_from_slice(trace);
        let filtered = self.bandpass.is_enabled() && self.bandpass.apply(&mut self.filtered_trace[..n]);

        self.cold_start();
        // Initial baseline guess before the first iteration refines it
        // jointly with the sparse code (spec §3 `baseline`, `fista_step`).
        // The bandpass filter already subtracts its own percentile floor
        // in-place when it runs; otherwise the raw trace still carries
        // whatever resting fluorescence offset the sensor recorded.
        self.baseline = if filtered { 0.0 } else { percentile_baseline(&self.trace[..n], 0.02) };
        Ok(())
    }

    fn grow_buffers(&mut self, n: usize) {
        if self.trace.len() < n {
            self.trace.resize(n, 0.0);
            self.filtered_trace.resize(n, 0.0);
            self.solution.resize(n, 0.0);
            self.solution_prev.resize(n, 0.0);
            self.gradient.resize(n, 0.0);
            self.reconvolution.resize(n, 0.0);
            self.residual_buf.resize(n, 0.0);
        }
    }

    /// Reset FISTA state (solution, momentum, iteration count) to a cold
    /// start. Used whenever warm-starting is unsafe (spec §4.2, `Cold`).
    pub fn cold_start(&mut self) {
        let n = self.active_len;
        self.solution[..n].fill(0.0);
        self.solution_prev[..n].fill(0.0);
        self.t_fista = 1.0;
        self.iteration = 0;
        self.converged = false;
        self.baseline = 0.0;
        self.reconvolution_stale = true;
    }

    /// Reset momentum only, keeping the current primal iterate (spec §4.2,
    /// `WarmNoMomentum`).
    pub fn reset_momentum(&mut self) {
        self.t_fista = 1.0;
        self.solution_prev[..self.active_len].copy_from_slice(&self.solution[..self.active_len]);
        self.converged = false;
    }

    /// Restore a previously exported state (spec §4.2, `Warm`/`WarmNoMomentum`).
    /// Rejects a blob whose fingerprint does not match the current active
    /// length, or whose kernel signature does not match the current
    /// `(tau_rise_s, tau_decay_s, fs)` — either way the caller must fall
    /// back to [`Solver::cold_start`].
    pub fn load_state(&mut self, blob: &StateBlob, strategy: WarmStartStrategy) -> Result<(), InvalidInput> {
        if blob.fingerprint_len() != self.active_len {
            return Err(InvalidInput::WarmStateLengthMismatch);
        }
        if !blob.matches_kernel(&self.params) {
            return Err(InvalidInput::WarmStateKernelMismatch);
        }
        let n = self.active_len;
        self.solution[..n].copy_from_slice(&blob.solution);
        self.solution_prev[..n].copy_from_slice(&blob.solution_prev);
        self.iteration = blob.iteration;
        self.baseline = blob.baseline;
        self.converged = false;
        self.reconvolution_stale = true;

        match strategy {
            WarmStartStrategy::Warm => {
                self.t_fista = blob.t_fista;
            }
            WarmStartStrategy::WarmNoMomentum => {
                self.t_fista = 1.0;
                self.solution_prev[..n].copy_from_slice(&self.solution[..n]);
            }
            WarmStartStrategy::Cold => {
                self.cold_start();
            }
        }
        Ok(())
    }

    /// Export current state for caching (spec §3 "Warm-Start Entry").
    pub fn export_state(&self) -> StateBlob {
        StateBlob::new(
            self.active_len,
            &self.params,
            self.t_fista,
            self.iteration,
            self.baseline,
            &self.solution[..self.active_len],
            &self.solution_prev[..self.active_len],
        )
    }

    /// Effective sparsity penalty, scaled by the kernel's DC gain so that
    /// `lambda` has roughly kernel-independent units (teacher's
    /// `effective_lambda`, `G_dc = sum(K)`).
    fn effective_lambda(&self) -> f64 {
        self.params.lambda * self.kernel_dc_gain.max(1e-12)
    }

    fn use_fft(&self) -> bool {
        self.active_len > FFT_THRESHOLD
    }

    /// Lazily recompute the reconvolution `K * s` for display.
    pub fn reconvolution(&mut self) -> &[f32] {
        if self.reconvolution_stale {
            let n = self.active_len;
            if self.use_fft() {
                self.fft.ensure_buffers(n, &self.kernel);
                self.fft.convolve_forward(&self.solution[..n], n, &mut self.reconvolution[..n]);
            } else {
                fista::convolve_time_domain(&self.solution[..n], &self.kernel, &mut self.reconvolution[..n]);
            }
            self.reconvolution_stale = false;
        }
        &self.reconvolution[..self.active_len]
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    pub fn trace(&self) -> &[f32] {
        &self.trace[..self.active_len]
    }

    /// Run up to `n_steps` FISTA iterations, checking `should_cancel` every
    /// `batch_size` inner steps (spec §4.1 "cooperative cancellation").
    /// Returns `SolveError::Divergence` if a non-finite value appears.
    pub fn step_batch(
        &mut self,
        n_steps: u32,
        batch_size: u32,
        mut should_cancel: impl FnMut() -> bool,
    ) -> Result<StepOutcome, SolveError> {
        let batch_size = batch_size.max(1);
        let mut remaining = n_steps;

        while remaining > 0 {
            if self.converged {
                return Ok(StepOutcome::Converged);
            }
            let chunk = remaining.min(batch_size);
            let outcome = self.step_inner(chunk)?;
            remaining -= chunk;
            if outcome == StepOutcome::Converged {
                return Ok(outcome);
            }
            if should_cancel() {
                return Ok(StepOutcome::Progressed);
            }
        }
        Ok(StepOutcome::Progressed)
    }

    fn step_inner(&mut self, n_steps: u32) -> Result<StepOutcome, SolveError> {
        for _ in 0..n_steps {
            let outcome = fista::fista_step(self)?;
            self.iteration += 1;
            self.reconvolution_stale = true;
            if outcome == StepOutcome::Converged {
                self.converged = true;
                return Ok(outcome);
            }
        }
        Ok(StepOutcome::Progressed)
    }
}

/// Robust resting-fluorescence floor: the value at the given low percentile,
/// used as an additive offset so FISTA's non-negativity constraint applies
/// to activity above baseline rather than above zero (spec §3 `baseline`).
fn percentile_baseline(trace: &[f32], percentile: f64) -> f64 {
    let n = trace.len();
    if n == 0 {
        return 0.0;
    }
    let idx = ((n as f64 * percentile).round() as usize).min(n - 1);
    let mut scratch = trace.to_vec();
    scratch.select_nth_unstable_by(idx, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    scratch[idx] as f64
}
