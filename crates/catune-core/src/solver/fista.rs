//! FISTA iteration (Beck & Teboulle, with gradient-scheme adaptive restart)
//! and its time-domain convolution helpers. Dispatches between the FFT and
//! direct-convolution paths by active length (spec §4.1 "Convolution
//! dispatch"), and checks a primal-residual convergence test rather than
//! the teacher's objective-based one — adopted from the FFT-wired
//! `step_batch` in the CaLab lineage (`crates-solver-src-fista.rs`), which
//! tracks the spec's own wording ("relative change in s") more directly.

use super::{Solver, StepOutcome};
use crate::error::SolveError;

/// `output[i] = sum_k kernel[k] * source[i - k]`, causal convolution.
pub(super) fn convolve_time_domain(source: &[f32], kernel: &[f32], output: &mut [f32]) {
    let n = source.len();
    for i in 0..n {
        let mut acc = 0.0_f32;
        let k_max = kernel.len().min(i + 1);
        for k in 0..k_max {
            acc += kernel[k] * source[i - k];
        }
        output[i] = acc;
    }
}

/// `output[j] = sum_k kernel[k] * source[j + k]`, the adjoint of
/// [`convolve_time_domain`] under the standard inner product.
fn convolve_adjoint_time_domain(source: &[f32], kernel: &[f32], output: &mut [f32]) {
    let n = source.len();
    for j in 0..n {
        let mut acc = 0.0_f32;
        let k_max = kernel.len().min(n - j);
        for k in 0..k_max {
            acc += kernel[k] * source[j + k];
        }
        output[j] = acc;
    }
}

/// Advance the solver by one FISTA iteration in place.
pub(super) fn fista_step(solver: &mut Solver) -> Result<StepOutcome, SolveError> {
    let n = solver.active_len;
    let use_fft = solver.use_fft();

    let t_old = solver.t_fista;
    let t_new = (1.0 + (1.0 + 4.0 * t_old * t_old).sqrt()) / 2.0;
    let momentum = ((t_old - 1.0) / t_new) as f32;

    for i in 0..n {
        solver.residual_buf[i] = solver.solution[i] + momentum * (solver.solution[i] - solver.solution_prev[i]);
    }

    // Ky, the forward model evaluated at the extrapolated point.
    if use_fft {
        solver.fft.ensure_buffers(n, &solver.kernel);
        solver.fft.convolve_forward(&solver.residual_buf[..n], n, &mut solver.reconvolution[..n]);
    } else {
        convolve_time_domain(&solver.residual_buf[..n], &solver.kernel, &mut solver.reconvolution[..n]);
    }

    // Re-estimate baseline jointly with the sparse code: b = mean(y - K*y_k).
    // Skipped when bandpass-filtered, since the filter already removes DC and
    // the baseline mathematically cancels in the gradient there — recomputing
    // it anyway would just chase momentum-oscillation noise (CaLab lineage
    // `fista.rs::step_batch`, step 1b).
    if !solver.bandpass.is_enabled() {
        let mut sum = 0.0_f64;
        for i in 0..n {
            sum += (solver.filtered_trace[i] - solver.reconvolution[i]) as f64;
        }
        solver.baseline = sum / n as f64;
    }
    let baseline = solver.baseline as f32;
    for i in 0..n {
        solver.gradient[i] = solver.reconvolution[i] - (solver.filtered_trace[i] - baseline);
    }

    // K^T (Ky - b), the gradient of the data term at y, written back into
    // the reconvolution buffer now that Ky has been consumed.
    if use_fft {
        solver.fft.convolve_adjoint(&solver.gradient[..n], n, &mut solver.reconvolution[..n]);
    } else {
        convolve_adjoint_time_domain(&solver.gradient[..n], &solver.kernel, &mut solver.reconvolution[..n]);
    }

    let step = 1.0 / solver.lipschitz_constant.max(1e-10);
    let threshold = (step * solver.effective_lambda()) as f32;
    let step = step as f32;

    solver.solution_prev[..n].copy_from_slice(&solver.solution[..n]);

    let mut diff_sq = 0.0_f64;
    let mut xk_sq = 0.0_f64;
    let mut non_finite = false;

    for i in 0..n {
        let grad_step = solver.residual_buf[i] - step * solver.reconvolution[i];
        let new_val = (grad_step - threshold).max(0.0);
        if !new_val.is_finite() {
            non_finite = true;
        }
        let delta = (new_val - solver.solution[i]) as f64;
        diff_sq += delta * delta;
        xk_sq += (new_val as f64) * (new_val as f64);
        solver.solution[i] = new_val;
    }

    if non_finite {
        return Err(SolveError::Divergence { iteration: solver.iteration });
    }

    // Gradient-scheme adaptive restart (O'Donoghue & Candès): reset momentum
    // whenever the step moved away from the extrapolation point in the same
    // direction it came from, a cheap proxy for "objective about to increase".
    let mut restart_dot = 0.0_f64;
    for i in 0..n {
        let y_minus_x = (solver.residual_buf[i] - solver.solution[i]) as f64;
        let x_minus_prev = (solver.solution[i] - solver.solution_prev[i]) as f64;
        restart_dot += y_minus_x * x_minus_prev;
    }
    solver.t_fista = if restart_dot > 0.0 { 1.0 } else { t_new };

    let tol_sq = solver.tolerance * solver.tolerance;
    let converged = solver.iteration > 5 && diff_sq < tol_sq * (xk_sq + 1e-20);
    Ok(if converged { StepOutcome::Converged } else { StepOutcome::Progressed })
}
