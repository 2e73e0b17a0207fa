use std::time::Duration;

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::{
    AcqError, AcquisitionMode, ChannelSettings, Conf, Sample, ScanSettings, SimulationSettings,
};

/// 2 * arccosh(sqrt(2)): scales the sech² argument so `fwhm` is the true
/// full width at half maximum.
const SECH2_FWHM_SCALE: f64 = 1.762_747_174_039_086;

/// Shots read per laser gate in triggered mode.
const TRIGGERED_BATCH: usize = 1024;

/// Capability interface over the shot stream, one instance per worker.
///
/// Trigger waits are blocking calls with an explicit deadline rather than
/// callbacks; that keeps the in-worker ordering trivial, which the
/// dark-control pairing depends on.
pub trait SampleSource: Send {
    /// Block until the shaker starts a new sweep (`shaker_trigger` edge).
    fn wait_sweep_start(&mut self) -> Result<(), AcqError>;

    /// Read one sweep's worth of shots, in physical order.
    fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError>;
}

pub type BoxedSource = Box<dyn SampleSource>;

/// Builds one source per worker; injected into the session so the simulated
/// and hardware pipelines share every line of downstream code.
pub type SourceFactory = Box<dyn Fn(usize) -> Result<BoxedSource, AcqError> + Send + Sync>;

/// Factory for the configured source kind. Only the simulated variant can be
/// built from configuration alone; the hardware driver is wired in by the
/// integration layer through [`hardware_factory`].
pub fn source_factory(conf: &Conf) -> Result<SourceFactory, AcqError> {
    if !conf.scan.simulate {
        return Err(AcqError::Config(
            "simulate = false requires a hardware backend, see hardware_factory()".into(),
        ));
    }
    let scan = conf.scan.clone();
    let sim = conf.simulation.clone();
    Ok(Box::new(move |worker| {
        let source = SimulatedSource::new(&scan, &sim, worker as u64)?;
        Ok(Box::new(source) as BoxedSource)
    }))
}

/// Factory wrapping an externally supplied analog I/O backend, one backend
/// instance per worker (channel handles are never shared).
pub fn hardware_factory<B, F>(conf: &Conf, make_backend: F) -> SourceFactory
where
    B: DaqBackend + 'static,
    F: Fn(usize) -> Result<B, AcqError> + Send + Sync + 'static,
{
    let scan = conf.scan.clone();
    let channels = conf.channels.clone();
    Box::new(move |worker| {
        let backend = make_backend(worker)?;
        Ok(Box::new(HardwareSource::new(backend, &scan, channels.clone())) as BoxedSource)
    })
}

/// External collaborator: the multichannel analog I/O board driver.
///
/// Implementations consume the configured line names verbatim
/// (e.g. `Dev1/ai0`, `Dev1/PFI0`).
pub trait DaqBackend: Send {
    /// Block until a rising edge on `line`, or fail with
    /// [`AcqError::HardwareTimeout`] once `timeout` elapses.
    fn wait_edge(&mut self, line: &str, timeout: Duration) -> Result<(), AcqError>;

    /// Read `n` synchronized scans across the given analog lines. Each scan
    /// holds one voltage per line, in the order the lines were passed.
    fn read_scans(&mut self, lines: &[&str; 4], n: usize) -> Result<Vec<Vec<f64>>, AcqError>;
}

/// Channel reader backed by real hardware.
pub struct HardwareSource<B> {
    backend: B,
    channels: ChannelSettings,
    mode: AcquisitionMode,
    timeout: Duration,
    shots_per_sweep: usize,
    laser_period: f64,
    shot_counter: u64,
}

impl<B: DaqBackend> HardwareSource<B> {
    pub fn new(backend: B, scan: &ScanSettings, channels: ChannelSettings) -> Self {
        Self {
            backend,
            channels,
            mode: scan.acquisition_mode,
            timeout: scan.trigger_timeout(),
            shots_per_sweep: scan.shots_per_sweep(),
            laser_period: 1.0 / scan.laser_rate_hz,
            shot_counter: 0,
        }
    }

    fn read_batch(&mut self, n: usize, out: &mut Vec<Sample>) -> Result<(), AcqError> {
        let lines = [
            self.channels.shaker_position.as_str(),
            self.channels.signal.as_str(),
            self.channels.darkcontrol.as_str(),
            self.channels.reference.as_str(),
        ];
        let scans = self.backend.read_scans(&lines, n)?;
        for scan in scans {
            let [position, signal, darkcontrol, reference] = scan[..] else {
                return Err(AcqError::ChannelRead(format!(
                    "expected 4 values per scan, got {}",
                    scan.len()
                )));
            };
            out.push(Sample {
                position,
                signal,
                darkcontrol,
                reference,
                t: self.shot_counter as f64 * self.laser_period,
            });
            self.shot_counter += 1;
        }
        Ok(())
    }
}

impl<B: DaqBackend> SampleSource for HardwareSource<B> {
    fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
        self.backend
            .wait_edge(&self.channels.shaker_trigger, self.timeout)
    }

    fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
        let mut sweep = Vec::with_capacity(self.shots_per_sweep);
        while sweep.len() < self.shots_per_sweep {
            let n = TRIGGERED_BATCH.min(self.shots_per_sweep - sweep.len());
            if self.mode == AcquisitionMode::Triggered {
                self.backend
                    .wait_edge(&self.channels.laser_trigger, self.timeout)?;
            }
            self.read_batch(n, &mut sweep)?;
        }
        Ok(sweep)
    }
}

/// Channel reader that synthesizes shots instead of touching hardware.
///
/// One sweep walks the shaker excursion (`shaker_amplitude` volts peak to
/// peak, centered on 0 V) one position step at a time, direction alternating
/// per sweep, with sub-step position jitter. Shots outside the binned travel
/// come out like on the real board and are discarded downstream. The
/// transient follows the configured `sech2_fwhm` waveform; with dark control
/// on, pumped and unpumped shots alternate pumped-first.
pub struct SimulatedSource {
    sim: SimulationSettings,
    dark_control: bool,
    step: f64,
    ps_per_step: f64,
    n_steps: usize,
    min_pos: f64,
    laser_period: f64,
    forward: bool,
    shot_counter: u64,
    rng: SmallRng,
}

impl SimulatedSource {
    pub fn new(scan: &ScanSettings, sim: &SimulationSettings, seed: u64) -> Result<Self, AcqError> {
        if sim.function != "sech2_fwhm" {
            return Err(AcqError::Config(format!(
                "unknown simulation function '{}'",
                sim.function
            )));
        }
        let n_steps = (sim.shaker_amplitude / scan.shaker_position_step).round() as usize;
        if n_steps == 0 {
            return Err(AcqError::Config(
                "shaker_amplitude must cover at least one position step".into(),
            ));
        }
        Ok(Self {
            sim: sim.clone(),
            dark_control: scan.dark_control,
            step: scan.shaker_position_step,
            ps_per_step: scan.shaker_ps_per_step,
            n_steps,
            min_pos: -0.5 * (n_steps as f64 - 1.0) * scan.shaker_position_step,
            laser_period: 1.0 / scan.laser_rate_hz,
            forward: true,
            shot_counter: 0,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    fn noise(&mut self) -> f64 {
        if self.sim.noise > 0.0 {
            self.rng.random_range(-self.sim.noise..self.sim.noise)
        } else {
            0.0
        }
    }

    fn shot(&mut self, position: f64, signal: f64, pumped: bool) -> Sample {
        let sample = Sample {
            position,
            signal,
            darkcontrol: if pumped { 4.0 } else { 0.0 },
            reference: 1.0 + self.noise(),
            t: self.shot_counter as f64 * self.laser_period,
        };
        self.shot_counter += 1;
        sample
    }

    fn pumped_signal(&self, delay_ps: f64) -> f64 {
        self.sim.amplitude * sech2_fwhm(delay_ps, self.sim.center_position, self.sim.fwhm)
            + self.sim.offset
    }
}

impl SampleSource for SimulatedSource {
    fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
        // The simulated shaker free-runs; the edge is always there.
        Ok(())
    }

    fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
        let n_steps = self.n_steps;
        let mut sweep = Vec::with_capacity(if self.dark_control {
            2 * n_steps
        } else {
            n_steps
        });
        for i in 0..n_steps {
            let k = if self.forward { i } else { n_steps - 1 - i };
            let nominal = self.min_pos + k as f64 * self.step;
            // Jitter below half a step keeps the shot inside its bin.
            let jitter = self.rng.random_range(-0.3..0.3) * self.step;
            let position = nominal + jitter;
            let delay = nominal / self.step * self.ps_per_step;

            let pumped = self.pumped_signal(delay) + self.noise();
            sweep.push(self.shot(position, pumped, true));
            if self.dark_control {
                let unpumped = self.sim.offset + self.noise();
                sweep.push(self.shot(position, unpumped, false));
            }
        }
        self.forward = !self.forward;
        debug!("simulated sweep of {} shots", sweep.len());
        Ok(sweep)
    }
}

/// sech² pulse with unit amplitude and true FWHM `fwhm`, centered at `center`.
pub fn sech2_fwhm(t: f64, center: f64, fwhm: f64) -> f64 {
    let x = SECH2_FWHM_SCALE * (t - center) / fwhm;
    let sech = 1.0 / x.cosh();
    sech * sech
}
