//! FFT-based convolution engine, adapted from the teacher
//! `wasm/catune-solver/src/fft.rs` verbatim in algorithm, generalized only in
//! that it no longer assumes a single global `Solver` — each worker's
//! [`crate::solver::Solver`] owns one.
//!
//! Kept a separate struct from `Solver` so callers can borrow it mutably
//! while simultaneously borrowing other solver fields (split borrows),
//! eliminating per-iteration `to_vec()` copies. Buffers grow but never
//! shrink, avoiding churn across quanta on a long-lived worker.

use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;
use std::sync::Arc;

pub(crate) struct FftConvolver {
    planner: RealFftPlanner<f32>,
    fft_len: usize, // padded FFT length (power of 2), 0 = uninitialized

    plan_fwd: Option<Arc<dyn realfft::RealToComplex<f32>>>,
    plan_inv: Option<Arc<dyn realfft::ComplexToReal<f32>>>,

    kernel_fft: Vec<Complex<f32>>,
    kernel_conj_fft: Vec<Complex<f32>>,

    fft_input: Vec<f32>,
    fft_output: Vec<f32>,
    fft_spectrum: Vec<Complex<f32>>,
    fft_scratch_fwd: Vec<Complex<f32>>,
    fft_scratch_inv: Vec<Complex<f32>>,
}

impl FftConvolver {
    pub(crate) fn new() -> Self {
        FftConvolver {
            planner: RealFftPlanner::new(),
            fft_len: 0,
            plan_fwd: None,
            plan_inv: None,
            kernel_fft: Vec::new(),
            kernel_conj_fft: Vec::new(),
            fft_input: Vec::new(),
            fft_output: Vec::new(),
            fft_spectrum: Vec::new(),
            fft_scratch_fwd: Vec::new(),
            fft_scratch_inv: Vec::new(),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.fft_len = 0;
        self.plan_fwd = None;
        self.plan_inv = None;
    }

    /// Ensure FFT buffers are allocated for the given signal + kernel size.
    /// Recomputes the kernel spectrum when the padded FFT length changes.
    pub(crate) fn ensure_buffers(&mut self, signal_len: usize, kernel: &[f32]) {
        let k_len = kernel.len();
        if signal_len == 0 || k_len == 0 {
            return;
        }

        let min_len = signal_len + k_len - 1;
        let padded_len = min_len.next_power_of_two();

        if padded_len == self.fft_len {
            return;
        }

        self.fft_len = padded_len;
        let spectrum_len = padded_len / 2 + 1;

        if self.fft_input.len() < padded_len {
            self.fft_input.resize(padded_len, 0.0);
        }
        if self.fft_output.len() < padded_len {
            self.fft_output.resize(padded_len, 0.0);
        }
        if self.fft_spectrum.len() < spectrum_len {
            self.fft_spectrum.resize(spectrum_len, Complex::new(0.0, 0.0));
        }
        if self.kernel_fft.len() < spectrum_len {
            self.kernel_fft.resize(spectrum_len, Complex::new(0.0, 0.0));
        }
        if self.kernel_conj_fft.len() < spectrum_len {
            self.kernel_conj_fft.resize(spectrum_len, Complex::new(0.0, 0.0));
        }

        let fwd = self.planner.plan_fft_forward(padded_len);
        let inv = self.planner.plan_fft_inverse(padded_len);
        let fwd_scratch = fwd.get_scratch_len();
        let inv_scratch = inv.get_scratch_len();
        if self.fft_scratch_fwd.len() < fwd_scratch {
            self.fft_scratch_fwd.resize(fwd_scratch, Complex::new(0.0, 0.0));
        }
        if self.fft_scratch_inv.len() < inv_scratch {
            self.fft_scratch_inv.resize(inv_scratch, Complex::new(0.0, 0.0));
        }
        self.plan_fwd = Some(fwd);
        self.plan_inv = Some(inv);

        self.prepare_kernel(kernel);
    }

    /// Recompute the kernel spectrum using the current padded length. Call
    /// after a kernel change when existing buffers are already large enough.
    pub(crate) fn prepare_kernel(&mut self, kernel: &[f32]) {
        let k_len = kernel.len();
        let padded_len = self.fft_len;
        let spectrum_len = padded_len / 2 + 1;

        for i in 0..padded_len {
            self.fft_input[i] = if i < k_len { kernel[i] } else { 0.0 };
        }

        let fwd = self.plan_fwd.as_ref().expect("plans not initialized").clone();
        fwd.process_with_scratch(
            &mut self.fft_input[..padded_len],
            &mut self.kernel_fft[..spectrum_len],
            &mut self.fft_scratch_fwd,
        )
        .unwrap();

        for i in 0..spectrum_len {
            self.kernel_conj_fft[i] = self.kernel_fft[i].conj();
        }
    }

    /// `output[..signal_len] = (K * source)[..signal_len]`.
    pub(crate) fn convolve_forward(&mut self, source: &[f32], signal_len: usize, output: &mut [f32]) {
        self.convolve_with(source, signal_len, output, false)
    }

    /// `output[..signal_len] = (K^T * source)[..signal_len]` (correlation = convolution with conjugated spectrum).
    pub(crate) fn convolve_adjoint(&mut self, source: &[f32], signal_len: usize, output: &mut [f32]) {
        self.convolve_with(source, signal_len, output, true)
    }

    fn convolve_with(&mut self, source: &[f32], signal_len: usize, output: &mut [f32], adjoint: bool) {
        let padded_len = self.fft_len;
        let spectrum_len = padded_len / 2 + 1;

        for i in 0..padded_len {
            self.fft_input[i] = if i < signal_len { source[i] } else { 0.0 };
        }

        let fwd = self.plan_fwd.as_ref().expect("plans not initialized").clone();
        fwd.process_with_scratch(
            &mut self.fft_input[..padded_len],
            &mut self.fft_spectrum[..spectrum_len],
            &mut self.fft_scratch_fwd,
        )
        .unwrap();

        let multiplier = if adjoint { &self.kernel_conj_fft } else { &self.kernel_fft };
        for i in 0..spectrum_len {
            self.fft_spectrum[i] *= multiplier[i];
        }

        let inv = self.plan_inv.as_ref().expect("plans not initialized").clone();
        inv.process_with_scratch(
            &mut self.fft_spectrum[..spectrum_len],
            &mut self.fft_output[..padded_len],
            &mut self.fft_scratch_inv,
        )
        .unwrap();

        let scale = 1.0 / padded_len as f32;
        for i in 0..signal_len {
            output[i] = self.fft_output[i] * scale;
        }
    }
}
