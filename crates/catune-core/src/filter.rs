//! Bandpass preprocessing filter, adapted from the teacher
//! `wasm/catune-solver/src/filter.rs`. Cutoffs are derived from the same
//! kernel time constants as the solver's calcium kernel, per spec §4.1:
//! high-pass removes baseline drift the kernel can't explain, low-pass
//! removes energy above what the kernel can produce.

use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;
use std::f32::consts::PI;

/// HP cutoff = 1/(2*pi*tau_decay*M_HP); 16x preserves the slow calcium decay
/// tail (~40s period at typical tau_decay=0.4s) while removing sub-calcium drift.
const MARGIN_FACTOR_HP: f32 = 16.0;
/// LP cutoff = M_LP/(2*pi*tau_rise); 4x gives tighter noise rejection above
/// the kernel's rise band.
const MARGIN_FACTOR_LP: f32 = 4.0;

pub(crate) struct BandpassFilter {
    enabled: bool,
    f_hp: f32,
    f_lp: f32,
    fs: f32,
    valid: bool,

    planner: RealFftPlanner<f32>,
    planned_len: usize,

    fft_input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    gain_curve: Vec<f32>,
    scratch_fwd: Vec<Complex<f32>>,
    scratch_inv: Vec<Complex<f32>>,
}

impl BandpassFilter {
    pub(crate) fn new() -> Self {
        BandpassFilter {
            enabled: false,
            f_hp: 0.0,
            f_lp: 0.0,
            fs: 30.0,
            valid: false,
            planner: RealFftPlanner::new(),
            planned_len: 0,
            fft_input: Vec::new(),
            spectrum: Vec::new(),
            gain_curve: Vec::new(),
            scratch_fwd: Vec::new(),
            scratch_inv: Vec::new(),
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn update_cutoffs(&mut self, tau_rise: f64, tau_decay: f64, fs: f64) {
        self.fs = fs as f32;
        let tau_rise = tau_rise as f32;
        let tau_decay = tau_decay as f32;

        if tau_rise <= 0.0 || tau_decay <= 0.0 || fs <= 0.0 {
            self.valid = false;
            return;
        }

        let nyquist = self.fs / 2.0;

        self.f_hp = 1.0 / (2.0 * PI * tau_decay * MARGIN_FACTOR_HP);
        self.f_lp = MARGIN_FACTOR_LP / (2.0 * PI * tau_rise);
        if self.f_lp > nyquist {
            self.f_lp = nyquist;
        }

        self.valid = self.f_hp < self.f_lp;
        self.planned_len = 0; // invalidate cached gain curve
    }

    fn ensure_buffers(&mut self, n: usize) {
        if n == self.planned_len {
            return;
        }

        let spectrum_len = n / 2 + 1;

        if self.fft_input.len() < n {
            self.fft_input.resize(n, 0.0);
        }
        if self.spectrum.len() < spectrum_len {
            self.spectrum.resize(spectrum_len, Complex::new(0.0, 0.0));
        }
        if self.gain_curve.len() < spectrum_len {
            self.gain_curve.resize(spectrum_len, 0.0);
        }

        let fwd = self.planner.plan_fft_forward(n);
        let inv = self.planner.plan_fft_inverse(n);
        let fwd_scratch = fwd.get_scratch_len();
        let inv_scratch = inv.get_scratch_len();
        if self.scratch_fwd.len() < fwd_scratch {
            self.scratch_fwd.resize(fwd_scratch, Complex::new(0.0, 0.0));
        }
        if self.scratch_inv.len() < inv_scratch {
            self.scratch_inv.resize(inv_scratch, Complex::new(0.0, 0.0));
        }

        self.build_gain_curve(n);
        self.planned_len = n;
    }

    fn build_gain_curve(&mut self, n: usize) {
        let spectrum_len = n / 2 + 1;
        let df = self.fs / n as f32;

        let w_hp = self.f_hp * 0.5;
        let w_lp = self.f_lp * 0.5;

        for i in 0..spectrum_len {
            let f = i as f32 * df;

            let gain = if f < self.f_hp - w_hp {
                0.0
            } else if f < self.f_hp + w_hp {
                let t = (f - (self.f_hp - w_hp)) / (2.0 * w_hp);
                0.5 * (1.0 - (PI * t).cos())
            } else if f < self.f_lp - w_lp {
                1.0
            } else if f < self.f_lp + w_lp {
                let t = (f - (self.f_lp - w_lp)) / (2.0 * w_lp);
                0.5 * (1.0 + (PI * t).cos())
            } else {
                0.0
            };

            self.gain_curve[i] = gain;
        }
    }

    /// Apply bandpass in-place. Caches the pre-filter power spectrum. Returns
    /// `false` if filtering was skipped (disabled, invalid cutoffs, or trace
    /// too short).
    pub(crate) fn apply(&mut self, trace: &mut [f32]) -> bool {
        if !self.enabled || !self.valid || trace.len() < 8 {
            return false;
        }

        let n = trace.len();
        self.ensure_buffers(n);
        let spectrum_len = n / 2 + 1;

        self.fft_input[..n].copy_from_slice(trace);

        let fwd = self.planner.plan_fft_forward(n);
        fwd.process_with_scratch(&mut self.fft_input[..n], &mut self.spectrum[..spectrum_len], &mut self.scratch_fwd)
            .unwrap();

        for i in 0..spectrum_len {
            self.spectrum[i] *= self.gain_curve[i];
        }

        let inv = self.planner.plan_fft_inverse(n);
        inv.process_with_scratch(&mut self.spectrum[..spectrum_len], &mut self.fft_input[..n], &mut self.scratch_inv)
            .unwrap();

        let scale = 1.0 / n as f32;
        for i in 0..n {
            trace[i] = self.fft_input[i] * scale;
        }

        // Baseline correction: shift so the 2nd percentile sits at 0. The
        // high-pass removed DC, leaving transients straddling zero; using a
        // low percentile (rather than the mean) gives a robust non-negative
        // floor for the FISTA non-negativity constraint without letting a
        // handful of noise troughs drag the whole trace down.
        let p_idx = ((n as f64 * 0.02).round() as usize).min(n.saturating_sub(1));
        self.fft_input[..n].copy_from_slice(trace);
        self.fft_input[..n].select_nth_unstable_by(p_idx, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let baseline = self.fft_input[p_idx];
        for v in trace.iter_mut() {
            *v -= baseline;
        }

        true
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_filter(tau_rise: f64, tau_decay: f64, fs: f64) -> BandpassFilter {
        let mut f = BandpassFilter::new();
        f.update_cutoffs(tau_rise, tau_decay, fs);
        f.set_enabled(true);
        f
    }

    #[test]
    fn cutoff_computation() {
        let f = make_filter(0.02, 0.4, 30.0);
        assert!(f.valid);
        assert!((f.f_hp - 0.0249).abs() < 0.005);
        assert!((f.f_lp - 15.0).abs() < 0.01); // clamped to Nyquist
    }

    #[test]
    fn passband_preserves_power() {
        let mut f = make_filter(0.02, 0.4, 100.0);
        let n = 1024;
        let fs = 100.0_f32;

        let freq = 1.0_f32;
        let mut trace: Vec<f32> = (0..n).map(|i| (2.0 * PI * freq * i as f32 / fs).sin()).collect();
        let orig_mean: f32 = trace.iter().sum::<f32>() / n as f32;
        let original_ac_power: f32 = trace.iter().map(|x| (x - orig_mean).powi(2)).sum();

        assert!(f.apply(&mut trace));

        let filt_mean: f32 = trace.iter().sum::<f32>() / n as f32;
        let filtered_ac_power: f32 = trace.iter().map(|x| (x - filt_mean).powi(2)).sum();
        assert!(filtered_ac_power / original_ac_power > 0.9);
    }

    #[test]
    fn stopband_attenuates() {
        let mut f = make_filter(0.02, 0.4, 100.0);
        let n = 65536;
        let fs = 100.0_f32;

        let freq = 0.005_f32;
        let mut trace: Vec<f32> = (0..n).map(|i| (2.0 * PI * freq * i as f32 / fs).sin()).collect();
        let original_power: f32 = trace.iter().map(|x| x * x).sum();

        assert!(f.apply(&mut trace));

        let filtered_power: f32 = trace.iter().map(|x| x * x).sum();
        assert!(filtered_power / original_power < 0.1);
    }

    #[test]
    fn dc_removed() {
        let mut f = make_filter(0.02, 0.4, 100.0);
        let mut trace = vec![5.0_f32; 256];
        assert!(f.apply(&mut trace));
        let mean: f32 = trace.iter().sum::<f32>() / trace.len() as f32;
        assert!(mean.abs() < 0.1);
    }

    #[test]
    fn short_trace_is_skipped() {
        let mut f = make_filter(0.02, 0.4, 30.0);
        let mut trace = vec![1.0, 2.0, 3.0];
        assert!(!f.apply(&mut trace));
    }

    #[test]
    fn invalid_cutoffs_are_skipped() {
        let mut f = BandpassFilter::new();
        f.update_cutoffs(10.0, 0.001, 30.0); // inverted cutoffs
        f.set_enabled(true);
        assert!(!f.valid);
        let mut trace = vec![1.0; 64];
        assert!(!f.apply(&mut trace));
    }

    #[test]
    fn disabled_is_noop() {
        let mut f = make_filter(0.02, 0.4, 30.0);
        f.set_enabled(false);
        let mut trace = vec![1.0; 64];
        let original = trace.clone();
        assert!(!f.apply(&mut trace));
        assert_eq!(trace, original);
    }
}
