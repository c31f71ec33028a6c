//! Calcium kernel construction and its Lipschitz estimate.
//!
//! Adapted from the teacher `wasm/catune-solver/src/kernel.rs`: same
//! double-exponential kernel and brute-force DFT Lipschitz bound, generalized
//! to take [`crate::params::SolverParams`] instead of loose `f64` arguments.

use crate::params::SolverParams;

/// Build a double-exponential calcium kernel normalized to peak = 1.0.
///
/// `h(t) = exp(-t/tau_decay) - exp(-t/tau_rise)`, normalized so `max(h) = 1.0`.
/// Kernel length extends until the decay envelope drops below `1e-6` of peak.
/// Computed in f64 for precision, returned as `Vec<f32>` (solver buffers are
/// f32 on their I/O boundary per spec's numeric semantics).
pub fn build_kernel(params: &SolverParams) -> Vec<f32> {
    let dt = 1.0 / params.fs;

    // -ln(1e-6) = 6*ln(10) ~ 13.8155
    let kernel_len = ((-1e-6_f64.ln()) * params.tau_decay_s / dt).ceil() as usize;
    let kernel_len = kernel_len.max(2);

    let mut kernel_f64 = Vec::with_capacity(kernel_len);
    let mut peak = 0.0_f64;

    for i in 0..kernel_len {
        let t = (i as f64) * dt;
        let val = (-t / params.tau_decay_s).exp() - (-t / params.tau_rise_s).exp();
        kernel_f64.push(val);
        if val > peak {
            peak = val;
        }
    }

    if peak > 0.0 {
        for v in kernel_f64.iter_mut() {
            *v /= peak;
        }
    }

    kernel_f64.iter().map(|&v| v as f32).collect()
}

/// Compute the Lipschitz constant of the gradient of `(1/2)||y - K*s||^2`.
///
/// `L = max_w |H(w)|^2`, the largest eigenvalue of `K^T K` for a circulant
/// convolution matrix — a tight upper bound for the causal (Toeplitz)
/// convolution matrix used in practice. Brute-force DFT is fine here: this
/// runs once per kernel change, not per iteration, and the kernel is short.
pub fn compute_lipschitz(kernel: &[f32]) -> f64 {
    let n = kernel.len();
    if n == 0 {
        return 1e-10;
    }

    let fft_len = (2 * n).next_power_of_two();

    let mut max_power = 0.0_f64;
    for w in 0..fft_len {
        let freq = 2.0 * std::f64::consts::PI * (w as f64) / (fft_len as f64);
        let mut re = 0.0_f64;
        let mut im = 0.0_f64;
        for (k, &hk) in kernel.iter().enumerate() {
            let hk64 = hk as f64;
            let angle = freq * (k as f64);
            re += hk64 * angle.cos();
            im -= hk64 * angle.sin();
        }
        let power = re * re + im * im;
        if power > max_power {
            max_power = power;
        }
    }

    max_power.max(1e-10)
}
