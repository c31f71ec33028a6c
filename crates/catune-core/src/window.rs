//! Overlap-and-discard windowing and the per-cell warm-start cache (spec
//! §3/§4.2). No teacher analog exists for this component — the teacher's
//! `Solver` only ever sees a single, already-carved trace segment; carving
//! it is a UI-layer concern in the teacher's lineage. Grounded directly in
//! the spec's own decision tables, in the small-pure-function style the
//! teacher uses for `kernel::build_kernel`/`compute_lipschitz`.

use crate::params::SolverParams;
use crate::solver::state::StateBlob;

/// Which parts of a previous solve are still useful for a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmStartStrategy {
    /// Reuse primal state and FISTA momentum.
    Warm,
    /// Reuse primal state, reset momentum for one iteration.
    WarmNoMomentum,
    /// Discard everything, initialize to zero.
    Cold,
}

/// Padded sub-problem boundaries for a visible viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddedWindow {
    pub padded_start: usize,
    pub padded_end: usize,
    pub result_offset: usize,
    pub result_length: usize,
}

impl PaddedWindow {
    /// Safe margin (spec §3): a cached result is reusable for a viewport iff
    /// the viewport lies within `[padded_start + margin, padded_end - margin]`.
    pub fn safe_margin(tau_decay_s: f64, fs: f64, padding_tau_multiplier: f64) -> usize {
        (padding_tau_multiplier * tau_decay_s * fs).ceil() as usize
    }

    /// Whether `[visible_start, visible_end)` lies within this window's safe
    /// region given `margin`.
    pub fn contains_safely(&self, visible_start: usize, visible_end: usize, margin: usize) -> bool {
        let safe_lo = self.padded_start.saturating_add(margin);
        let safe_hi = self.padded_end.saturating_sub(margin);
        safe_lo <= visible_start && visible_end <= safe_hi
    }
}

/// Compute padded window bounds for a visible viewport (spec §3 "Padded Window").
pub fn compute_padded_window(
    visible_start: usize,
    visible_end: usize,
    trace_len: usize,
    tau_decay_s: f64,
    fs: f64,
    padding_tau_multiplier: f64,
    max_padding_seconds: f64,
) -> PaddedWindow {
    debug_assert!(visible_start <= visible_end && visible_end <= trace_len);

    let visible_samples = visible_end - visible_start;
    let tau_padding = (padding_tau_multiplier * tau_decay_s * fs).ceil() as usize;
    let max_padding = (max_padding_seconds * fs).ceil() as usize;
    let padding = visible_samples.max(tau_padding).min(max_padding);

    let padded_start = visible_start.saturating_sub(padding);
    let padded_end = (visible_end + padding).min(trace_len);

    PaddedWindow {
        padded_start,
        padded_end,
        result_offset: visible_start - padded_start,
        result_length: visible_end - visible_start,
    }
}

/// Compare a cached entry to an incoming request and decide how much of the
/// previous solve is reusable (spec §3 decision table, evaluated in order).
pub fn classify_strategy(
    cached: Option<(&SolverParams, &PaddedWindow)>,
    new_params: &SolverParams,
    new_window: &PaddedWindow,
    tau_change_threshold: f64,
) -> WarmStartStrategy {
    let Some((cached_params, cached_window)) = cached else {
        return WarmStartStrategy::Cold;
    };

    if cached_window.padded_start != new_window.padded_start || cached_window.padded_end != new_window.padded_end {
        return WarmStartStrategy::Cold;
    }

    if cached_params.fs != new_params.fs || cached_params.filter_enabled != new_params.filter_enabled {
        return WarmStartStrategy::Cold;
    }

    let lambda_only_differs = cached_params.tau_rise_s == new_params.tau_rise_s
        && cached_params.tau_decay_s == new_params.tau_decay_s
        && cached_params.lambda != new_params.lambda;
    if lambda_only_differs {
        return WarmStartStrategy::Warm;
    }
    if cached_params.lambda == new_params.lambda
        && cached_params.tau_rise_s == new_params.tau_rise_s
        && cached_params.tau_decay_s == new_params.tau_decay_s
    {
        return WarmStartStrategy::Warm;
    }

    let (rel_rise, rel_decay) = new_params.relative_tau_change(cached_params);
    if rel_rise >= tau_change_threshold || rel_decay >= tau_change_threshold {
        return WarmStartStrategy::Cold;
    }

    WarmStartStrategy::WarmNoMomentum
}

/// Single-entry per-cell warm-start cache (spec §3 "Warm-Start Entry").
#[derive(Default)]
pub struct WarmStartCache {
    entry: Option<CacheEntry>,
}

struct CacheEntry {
    state_blob: StateBlob,
    params: SolverParams,
    window: PaddedWindow,
}

impl WarmStartCache {
    pub fn new() -> Self {
        WarmStartCache { entry: None }
    }

    pub fn store(&mut self, state_blob: StateBlob, params: SolverParams, window: PaddedWindow) {
        self.entry = Some(CacheEntry { state_blob, params, window });
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Classify the incoming request against the cache and return the
    /// strategy plus the cached blob bytes to warm-start from, if any.
    pub fn get_strategy(
        &self,
        new_params: &SolverParams,
        new_window: &PaddedWindow,
        tau_change_threshold: f64,
    ) -> (WarmStartStrategy, Option<StateBlob>) {
        let cached = self.entry.as_ref().map(|e| (&e.params, &e.window));
        let strategy = classify_strategy(cached, new_params, new_window, tau_change_threshold);
        match strategy {
            WarmStartStrategy::Cold => (strategy, None),
            _ => (strategy, self.entry.as_ref().map(|e| e.state_blob.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tau_rise: f64, tau_decay: f64, lambda: f64, fs: f64, filt: bool) -> SolverParams {
        SolverParams::new(tau_rise, tau_decay, lambda, fs, filt)
    }

    #[test]
    fn padded_window_respects_bounds_invariant() {
        let w = compute_padded_window(1000, 2000, 10_000, 0.4, 30.0, 5.0, 300.0);
        assert!(w.padded_start <= 1000);
        assert!(2000 <= w.padded_end);
        assert!(w.padded_end <= 10_000);
        assert_eq!(w.result_offset + w.result_length, 2000 - w.padded_start);
    }

    #[test]
    fn viewport_at_trace_start_has_zero_padded_start() {
        let w = compute_padded_window(0, 500, 10_000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(w.padded_start, 0);
        assert_eq!(w.result_offset, 0);
    }

    #[test]
    fn viewport_at_trace_end_clamps_padded_end() {
        let w = compute_padded_window(9500, 10_000, 10_000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(w.padded_end, 10_000);
    }

    #[test]
    fn full_trace_viewport_is_unpadded() {
        let w = compute_padded_window(0, 10_000, 10_000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(w.padded_start, 0);
        assert_eq!(w.padded_end, 10_000);
    }

    #[test]
    fn padding_is_capped_by_max_padding_seconds() {
        // Huge tau_decay would otherwise demand enormous padding.
        let w = compute_padded_window(1000, 1001, 100_000, 1000.0, 30.0, 5.0, 300.0);
        let max_padding = (300.0_f64 * 30.0).ceil() as usize;
        assert_eq!(w.padded_start, 1000 - max_padding.min(1000));
    }

    #[test]
    fn no_cached_entry_is_cold() {
        let p = params(0.02, 0.4, 0.01, 30.0, false);
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(None, &p, &w, 0.20), WarmStartStrategy::Cold);
    }

    #[test]
    fn lambda_only_change_is_warm() {
        let old = params(0.02, 0.4, 0.01, 30.0, false);
        let new = params(0.02, 0.4, 0.05, 30.0, false);
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(Some((&old, &w)), &new, &w, 0.20), WarmStartStrategy::Warm);
    }

    #[test]
    fn small_tau_decay_change_is_warm_no_momentum() {
        let old = params(0.02, 0.4, 0.01, 30.0, false);
        let new = params(0.02, 0.44, 0.01, 30.0, false); // 10% change
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(
            classify_strategy(Some((&old, &w)), &new, &w, 0.20),
            WarmStartStrategy::WarmNoMomentum
        );
    }

    #[test]
    fn large_tau_decay_change_is_cold() {
        let old = params(0.02, 0.4, 0.01, 30.0, false);
        let new = params(0.02, 0.8, 0.01, 30.0, false); // 100% change
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(Some((&old, &w)), &new, &w, 0.20), WarmStartStrategy::Cold);
    }

    #[test]
    fn window_shift_is_cold() {
        let p = params(0.02, 0.4, 0.01, 30.0, false);
        let old_window = compute_padded_window(1000, 2000, 10_000, 0.4, 30.0, 5.0, 300.0);
        let new_window = compute_padded_window(1100, 2100, 10_000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(Some((&p, &old_window)), &p, &new_window, 0.20), WarmStartStrategy::Cold);
    }

    #[test]
    fn fs_change_is_cold() {
        let old = params(0.02, 0.4, 0.01, 30.0, false);
        let new = params(0.02, 0.4, 0.01, 60.0, false);
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(Some((&old, &w)), &new, &w, 0.20), WarmStartStrategy::Cold);
    }

    #[test]
    fn filter_enabled_change_is_cold() {
        let old = params(0.02, 0.4, 0.01, 30.0, false);
        let new = params(0.02, 0.4, 0.01, 30.0, true);
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        assert_eq!(classify_strategy(Some((&old, &w)), &new, &w, 0.20), WarmStartStrategy::Cold);
    }

    #[test]
    fn cache_empty_get_strategy_returns_cold_and_no_blob() {
        let cache = WarmStartCache::new();
        let p = params(0.02, 0.4, 0.01, 30.0, false);
        let w = compute_padded_window(0, 100, 1000, 0.4, 30.0, 5.0, 300.0);
        let (strategy, blob) = cache.get_strategy(&p, &w, 0.20);
        assert_eq!(strategy, WarmStartStrategy::Cold);
        assert!(blob.is_none());
    }

    #[test]
    fn safe_margin_contains_interior_viewport() {
        let w = compute_padded_window(1000, 2000, 10_000, 0.4, 30.0, 5.0, 300.0);
        let margin = PaddedWindow::safe_margin(0.4, 30.0, 5.0);
        assert!(w.contains_safely(1000 + margin, 2000 - margin.min(500), margin));
    }
}
