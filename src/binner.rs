use crate::ScanSettings;

/// Quantizes the raw shaker-position voltage into a bin index.
///
/// The travel is centered on 0 V, so bin `n_bins / 2` sits at the nominal
/// overlap position. Deterministic and side-effect free; callers count and
/// log the out-of-travel drops themselves.
#[derive(Debug, Clone, Copy)]
pub struct PositionBinner {
    n_bins: usize,
    step: f64,
    min_raw: f64,
    ps_per_step: f64,
}

impl PositionBinner {
    pub fn new(n_bins: usize, step: f64, ps_per_step: f64) -> Self {
        let min_raw = -0.5 * (n_bins as f64 - 1.0) * step;
        Self {
            n_bins,
            step,
            min_raw,
            ps_per_step,
        }
    }

    pub fn from_settings(scan: &ScanSettings) -> Self {
        Self::new(
            scan.n_samples,
            scan.shaker_position_step,
            scan.shaker_ps_per_step,
        )
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    /// Lowest in-travel position voltage (center of bin 0).
    pub fn min_raw(&self) -> f64 {
        self.min_raw
    }

    /// Map a raw position voltage to a bin index, or `None` when the shaker
    /// is outside the configured travel.
    pub fn bin(&self, raw: f64) -> Option<usize> {
        let fractional = (raw - self.min_raw) / self.step;
        let idx = fractional.round();
        if idx < 0.0 || idx >= self.n_bins as f64 {
            return None;
        }
        Some(idx as usize)
    }

    /// Pump-probe delay at the center of `bin`, in picoseconds, relative to
    /// the middle of the travel.
    pub fn delay_ps(&self, bin: usize) -> f64 {
        (bin as f64 - 0.5 * (self.n_bins as f64 - 1.0)) * self.ps_per_step
    }

    /// Full delay axis, one entry per bin.
    pub fn time_axis(&self) -> Vec<f64> {
        (0..self.n_bins).map(|b| self.delay_ps(b)).collect()
    }
}
