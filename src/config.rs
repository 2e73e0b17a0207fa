use confique::Config;
use serde::Deserialize;
use std::time::Duration;

use crate::AcqError;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub scan: ScanSettings,
    #[config(nested)]
    pub channels: ChannelSettings,
    #[config(nested)]
    pub simulation: SimulationSettings,
    #[config(nested)]
    pub paths: PathSettings,
}

/// Core acquisition parameters. Defaults mirror the instrument's usual
/// operating point (18000 position steps, 50 sweeps per bin).
#[derive(Config, Debug, Clone)]
pub struct ScanSettings {
    #[config(default = true)]
    pub simulate: bool,
    #[config(default = 18000)]
    pub n_samples: usize,
    #[config(default = 50)]
    pub n_averages: u32,
    #[config(default = 4)]
    pub n_processors: usize,
    #[config(default = "triggered")]
    pub acquisition_mode: AcquisitionMode,
    #[config(default = true)]
    pub dark_control: bool,
    #[config(default = false)]
    pub use_r0: bool,
    /// Shaker position voltage covered by one bin.
    #[config(default = 0.000152587890625)]
    pub shaker_position_step: f64,
    /// Pump-probe delay covered by one bin, in picoseconds.
    #[config(default = 0.05)]
    pub shaker_ps_per_step: f64,
    /// Laser repetition rate, used for the shot timestamps.
    #[config(default = 273000.0)]
    pub laser_rate_hz: f64,
    #[config(default = 1000)]
    pub trigger_timeout_ms: u64,
}

/// Physical line assignment on the analog I/O board. The strings are passed
/// verbatim to the hardware backend.
#[derive(Config, Debug, Clone)]
pub struct ChannelSettings {
    #[config(default = "Dev1/ai0")]
    pub shaker_position: String,
    #[config(default = "Dev1/ai1")]
    pub signal: String,
    #[config(default = "Dev1/ai2")]
    pub darkcontrol: String,
    #[config(default = "Dev1/ai3")]
    pub reference: String,
    #[config(default = "Dev1/PFI0")]
    pub shaker_trigger: String,
    #[config(default = "Dev1/PFI1")]
    pub laser_trigger: String,
}

/// Synthetic waveform used when `scan.simulate` is on.
#[derive(Config, Debug, Clone)]
pub struct SimulationSettings {
    #[config(default = "sech2_fwhm")]
    pub function: String,
    #[config(default = 1.0)]
    pub amplitude: f64,
    /// Pulse overlap position, in picoseconds.
    #[config(default = 0.0)]
    pub center_position: f64,
    /// Pulse duration (FWHM), in picoseconds.
    #[config(default = 0.085)]
    pub fwhm: f64,
    #[config(default = 1.0)]
    pub offset: f64,
    /// Peak-to-peak shaker travel, in volts.
    #[config(default = 10.0)]
    pub shaker_amplitude: f64,
    /// Uniform noise amplitude added to every synthesized shot.
    #[config(default = 0.01)]
    pub noise: f64,
}

#[derive(Config, Debug, Clone)]
pub struct PathSettings {
    #[config(default = "data")]
    pub h5_data: String,
    #[config(default = "fastscan.log")]
    pub log_file: String,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Sample batches are gated on a laser trigger edge.
    Triggered,
    /// Free-running readout against the board clock.
    Continuous,
}

impl ScanSettings {
    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    /// Shots read per sweep: one per bin, doubled when alternating
    /// pumped/unpumped shots for dark control.
    pub fn shots_per_sweep(&self) -> usize {
        if self.dark_control {
            2 * self.n_samples
        } else {
            self.n_samples
        }
    }

    pub fn validate(&self) -> Result<(), AcqError> {
        if self.n_samples == 0 {
            return Err(AcqError::Config("n_samples must be at least 1".into()));
        }
        if self.n_averages == 0 {
            return Err(AcqError::Config("n_averages must be at least 1".into()));
        }
        if self.n_processors == 0 {
            return Err(AcqError::Config("n_processors must be at least 1".into()));
        }
        if self.shaker_position_step <= 0.0 {
            return Err(AcqError::Config(
                "shaker_position_step must be positive".into(),
            ));
        }
        Ok(())
    }
}
