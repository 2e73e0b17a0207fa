use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::{
    Accumulator, AcqError, Demodulator, MergeOutcome, PositionBinner, ScanSettings, Snapshot,
    SourceFactory,
};

/// Retries granted per sweep attempt when a shaker or laser trigger wait
/// times out, before the worker gives up and reports the error.
const MAX_TRIGGER_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-sweep progress report sent to the UI over the stats channel.
#[derive(Debug, Clone, Copy)]
pub struct SweepStats {
    pub worker: usize,
    /// Sweeps completed by this worker so far.
    pub sweeps: u64,
    /// Shots in the sweep just processed.
    pub shots: usize,
    /// Bins that have reached the `n_averages` cap, across all workers.
    pub filled_bins: usize,
    /// Shots discarded in this sweep because the shaker was out of travel
    /// (two per dropped dark-control pair).
    pub out_of_range: usize,
    /// Merges rejected in this sweep because the bin was already full.
    pub over_limit: usize,
}

/// Owns one acquisition run: configuration, the shared accumulator and the
/// worker pool. Lifecycle: `Idle → Running → {Completed, Stopped, Failed}`.
pub struct AcquisitionSession {
    scan: ScanSettings,
    accumulator: Arc<Accumulator>,
    state: Arc<Mutex<SessionState>>,
    stop: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl AcquisitionSession {
    pub fn new(scan: ScanSettings) -> Result<Self, AcqError> {
        scan.validate()?;
        let accumulator = Arc::new(Accumulator::new(scan.n_samples, scan.n_averages));
        Ok(Self {
            scan,
            accumulator,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            stop: Arc::new(AtomicBool::new(false)),
            supervisor: None,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Partial averages are always retrievable, also after `Stopped`.
    pub fn snapshot(&self) -> Snapshot {
        self.accumulator.snapshot()
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    /// Launch `n_processors` workers, each with its own source from
    /// `factory`. Rejected with `AlreadyRunning` while a run is in flight;
    /// a finished session can be started again and begins from a clean
    /// accumulator.
    pub fn start(&mut self, factory: SourceFactory) -> Result<Receiver<SweepStats>, AcqError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == SessionState::Running {
                return Err(AcqError::AlreadyRunning);
            }
            *state = SessionState::Running;
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.accumulator.reset();
        self.stop.store(false, Ordering::SeqCst);

        let factory = Arc::new(factory);
        let (tx_stats, rx_stats) = unbounded();
        // Workers block on this gate until the whole pool is spawned, so no
        // source starts consuming triggers before its peers exist.
        let start_gate = Arc::new((Mutex::new(false), Condvar::new()));

        let mut workers = Vec::with_capacity(self.scan.n_processors);
        for worker_id in 0..self.scan.n_processors {
            let factory = Arc::clone(&factory);
            let scan = self.scan.clone();
            let accumulator = Arc::clone(&self.accumulator);
            let stop = Arc::clone(&self.stop);
            let gate = Arc::clone(&start_gate);
            let tx = tx_stats.clone();
            workers.push(thread::spawn(move || {
                let source = factory(worker_id)?;
                worker_loop(worker_id, source, &scan, &accumulator, &stop, &gate, &tx)
            }));
        }
        drop(tx_stats);

        {
            let (lock, cvar) = &*start_gate;
            let mut started = lock.lock().unwrap_or_else(|e| e.into_inner());
            *started = true;
            cvar.notify_all();
        }
        info!(
            "acquisition started: {} workers, {} bins, {} averages",
            self.scan.n_processors, self.scan.n_samples, self.scan.n_averages
        );

        let state = Arc::clone(&self.state);
        let accumulator = Arc::clone(&self.accumulator);
        let stop = Arc::clone(&self.stop);
        self.supervisor = Some(thread::spawn(move || {
            supervise(workers, &state, &accumulator, &stop);
        }));

        Ok(rx_stats)
    }

    /// Cooperative cancellation: workers observe the flag at sweep
    /// boundaries and after trigger waits, then exit cleanly.
    pub fn stop(&self) {
        info!("acquisition stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the run to end and return the terminal state.
    pub fn join(&mut self) -> SessionState {
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.state()
    }
}

fn supervise(
    workers: Vec<JoinHandle<Result<u64, AcqError>>>,
    state: &Mutex<SessionState>,
    accumulator: &Accumulator,
    stop: &AtomicBool,
) {
    let mut failures = 0usize;
    let n_workers = workers.len();
    for (worker_id, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(sweeps)) => debug!("worker {worker_id} finished after {sweeps} sweeps"),
            Ok(Err(e)) => {
                error!("worker {worker_id} failed: {e}");
                failures += 1;
            }
            Err(_) => {
                error!("worker {worker_id} panicked");
                failures += 1;
            }
        }
    }

    let final_state = if accumulator.is_complete() {
        SessionState::Completed
    } else if stop.load(Ordering::SeqCst) {
        SessionState::Stopped
    } else {
        // Workers only abandon an unfinished, uncancelled run on error.
        debug_assert_eq!(failures, n_workers);
        SessionState::Failed
    };
    *state.lock().unwrap_or_else(|e| e.into_inner()) = final_state;
    info!(
        "acquisition finished: {final_state} ({}/{} bins at target, {} merges, {} rejected)",
        accumulator.filled_bins(),
        accumulator.n_bins(),
        accumulator.total_merges(),
        accumulator.rejected_merges(),
    );
}

/// One worker's pipeline: trigger wait → sweep read → bin → demodulate →
/// merge. Samples are processed in physical order so the dark-control
/// pairing stays aligned; ordering across workers does not matter because
/// the accumulator only sums.
fn worker_loop(
    worker_id: usize,
    mut source: crate::BoxedSource,
    scan: &ScanSettings,
    accumulator: &Accumulator,
    stop: &AtomicBool,
    gate: &(Mutex<bool>, Condvar),
    tx_stats: &Sender<SweepStats>,
) -> Result<u64, AcqError> {
    {
        let (lock, cvar) = gate;
        let mut started = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*started {
            started = cvar.wait(started).unwrap_or_else(|e| e.into_inner());
        }
    }

    let binner = PositionBinner::from_settings(scan);
    let mut demod = Demodulator::new(scan.dark_control, scan.use_r0);
    let mut sweeps = 0u64;
    let mut retries = 0u32;

    loop {
        if stop.load(Ordering::SeqCst) || accumulator.is_complete() {
            break;
        }

        if let Err(e) = source.wait_sweep_start() {
            if e.is_retryable() && retries < MAX_TRIGGER_RETRIES {
                retries += 1;
                warn!("worker {worker_id}: {e}, retry {retries}/{MAX_TRIGGER_RETRIES}");
                continue;
            }
            return Err(e);
        }

        // Stop may have been raised during the trigger wait.
        if stop.load(Ordering::SeqCst) {
            break;
        }

        // A dropout mid-sweep gets the same bounded retry as a missed sweep
        // trigger; the partial sweep is discarded so pairing stays aligned.
        let sweep = match source.read_sweep() {
            Ok(sweep) => sweep,
            Err(e) if e.is_retryable() && retries < MAX_TRIGGER_RETRIES => {
                retries += 1;
                demod.reset();
                warn!("worker {worker_id}: {e}, retry {retries}/{MAX_TRIGGER_RETRIES}");
                continue;
            }
            Err(e) => return Err(e),
        };
        retries = 0;

        let shots = sweep.len();
        let dropped_before = demod.dropped_shots();
        let mut over_limit = 0usize;
        for sample in sweep {
            let bin = binner.bin(sample.position);
            if let Some(point) = demod.push(bin, sample) {
                if accumulator.merge(&point) == MergeOutcome::AtLimit {
                    over_limit += 1;
                }
            }
        }
        let out_of_range = (demod.dropped_shots() - dropped_before) as usize;
        sweeps += 1;

        if out_of_range > 0 {
            warn!("worker {worker_id}: dropped {out_of_range} shots outside the shaker travel");
        }
        if over_limit > 0 {
            debug!("worker {worker_id}: {over_limit} merges past the average limit");
        }
        let _ = tx_stats.send(SweepStats {
            worker: worker_id,
            sweeps,
            shots,
            filled_bins: accumulator.filled_bins(),
            out_of_range,
            over_limit,
        });
    }
    Ok(sweeps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sech2_fwhm, source_factory, BoxedSource, Conf, Sample, SampleSource, ScanSettings};
    use confique::Config;

    fn test_scan(n_samples: usize, n_averages: u32, n_processors: usize) -> ScanSettings {
        let mut scan = Conf::builder().load().expect("defaults").scan;
        scan.n_samples = n_samples;
        scan.n_averages = n_averages;
        scan.n_processors = n_processors;
        scan.shaker_position_step = 0.001;
        scan
    }

    fn simulated_factory(scan: &ScanSettings) -> SourceFactory {
        let mut conf = Conf::builder().load().expect("defaults");
        // Excursion spans the binned travel exactly, so one sweep hits
        // every bin exactly once.
        conf.simulation.shaker_amplitude = scan.n_samples as f64 * scan.shaker_position_step;
        conf.scan = scan.clone();
        source_factory(&conf).expect("simulated factory")
    }

    fn run_to_end(scan: ScanSettings) -> (SessionState, crate::Snapshot) {
        let factory = simulated_factory(&scan);
        let mut session = AcquisitionSession::new(scan).unwrap();
        let rx = session.start(factory).unwrap();
        drop(rx);
        let state = session.join();
        let snap = session.snapshot();
        (state, snap)
    }

    #[test]
    fn completes_with_every_bin_at_target() {
        let scan = test_scan(40, 5, 2);
        let (state, snap) = run_to_end(scan);
        assert_eq!(state, SessionState::Completed);
        assert!(snap.counts.iter().all(|&c| c == 5));
    }

    #[test]
    fn single_worker_needs_n_averages_sweeps() {
        let scan = test_scan(24, 4, 1);
        let factory = simulated_factory(&scan);
        let mut session = AcquisitionSession::new(scan).unwrap();
        let rx = session.start(factory).unwrap();
        let last = rx.iter().last().expect("at least one sweep");
        assert_eq!(session.join(), SessionState::Completed);
        // One contribution per bin per sweep: completion takes exactly
        // n_averages full sweeps.
        assert_eq!(last.sweeps, 4);
    }

    #[test]
    fn dark_control_pipeline_completes_too() {
        let mut scan = test_scan(16, 3, 2);
        scan.dark_control = true;
        scan.use_r0 = true;
        let binner = PositionBinner::from_settings(&scan);
        let (state, snap) = run_to_end(scan);
        assert_eq!(state, SessionState::Completed);
        assert!(snap.counts.iter().all(|&c| c == 3));
        // The pump-probe difference cancels the offset: what is left is the
        // bare transient (defaults: amplitude 1, fwhm 0.085 ps).
        for bin in 0..16 {
            let expected = sech2_fwhm(binner.delay_ps(bin), 0.0, 0.085);
            assert!((snap.mean[bin] - expected).abs() < 0.1);
        }
    }

    #[test]
    fn simulated_run_reproduces_the_sech2_transient() {
        // Round trip of the configured waveform with dark control off:
        // defaults are amplitude 1, fwhm 0.085, offset 1.
        let mut scan = test_scan(81, 6, 2);
        scan.dark_control = false;
        let binner = PositionBinner::from_settings(&scan);
        let (state, snap) = run_to_end(scan);
        assert_eq!(state, SessionState::Completed);
        for bin in 0..81 {
            let expected = sech2_fwhm(binner.delay_ps(bin), 0.0, 0.085) + 1.0;
            assert!(
                (snap.mean[bin] - expected).abs() < 0.05,
                "bin {bin}: {} vs {expected}",
                snap.mean[bin]
            );
        }
    }

    #[test]
    fn restart_rejected_while_running() {
        // Average target far out of reach, so the run is still in flight
        // when the second start arrives.
        let scan = test_scan(32, 10_000_000, 1);
        let factory = simulated_factory(&scan);
        let second = simulated_factory(&scan);
        let mut session = AcquisitionSession::new(scan).unwrap();
        let rx = session.start(factory).unwrap();
        match session.start(second) {
            Err(AcqError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        session.stop();
        drop(rx);
        assert_eq!(session.join(), SessionState::Stopped);
    }

    #[test]
    fn stop_preserves_partial_averages() {
        let scan = test_scan(32, 10_000_000, 2);
        let n_averages = scan.n_averages;
        let factory = simulated_factory(&scan);
        let mut session = AcquisitionSession::new(scan).unwrap();
        let rx = session.start(factory).unwrap();
        // Let a few sweeps through, then cancel.
        for _ in 0..4 {
            let _ = rx.recv();
        }
        session.stop();
        let state = session.join();
        assert_eq!(state, SessionState::Stopped);
        let snap = session.snapshot();
        assert!(snap.counts.iter().any(|&c| c > 0));
        assert!(snap.counts.iter().all(|&c| c <= n_averages));
    }

    #[test]
    fn finished_session_can_be_restarted() {
        let scan = test_scan(16, 2, 1);
        let factory = simulated_factory(&scan);
        let again = simulated_factory(&scan);
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Completed);
        drop(session.start(again).unwrap());
        assert_eq!(session.join(), SessionState::Completed);
        assert!(session.snapshot().counts.iter().all(|&c| c == 2));
    }

    /// Source that fails with a non-retryable error on the first read.
    struct BrokenSource;

    impl SampleSource for BrokenSource {
        fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
            Ok(())
        }
        fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
            Err(AcqError::ChannelRead("scan width mismatch".into()))
        }
    }

    /// Source whose trigger never arrives.
    struct DeadTriggerSource;

    impl SampleSource for DeadTriggerSource {
        fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
            Err(AcqError::HardwareTimeout {
                line: "Dev1/PFI0".into(),
                timeout: std::time::Duration::from_millis(1),
            })
        }
        fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
            unreachable!("no sweep without a trigger")
        }
    }

    /// Source whose laser gate drops out once mid-sweep, then recovers.
    struct FlakyLaserSource {
        inner: BoxedSource,
        dropped_out: bool,
    }

    impl SampleSource for FlakyLaserSource {
        fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
            self.inner.wait_sweep_start()
        }
        fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
            if !self.dropped_out {
                self.dropped_out = true;
                return Err(AcqError::HardwareTimeout {
                    line: "Dev1/PFI1".into(),
                    timeout: std::time::Duration::from_millis(1),
                });
            }
            self.inner.read_sweep()
        }
    }

    #[test]
    fn transient_laser_dropout_is_retried() {
        let scan = test_scan(16, 3, 1);
        let sim = simulated_factory(&scan);
        let factory: SourceFactory = Box::new(move |worker| {
            Ok(Box::new(FlakyLaserSource {
                inner: sim(worker)?,
                dropped_out: false,
            }) as BoxedSource)
        });
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Completed);
        assert!(session.snapshot().counts.iter().all(|&c| c == 3));
    }

    /// Source whose laser gate never fires once the sweep has started.
    struct DeadLaserSource;

    impl SampleSource for DeadLaserSource {
        fn wait_sweep_start(&mut self) -> Result<(), AcqError> {
            Ok(())
        }
        fn read_sweep(&mut self) -> Result<Vec<Sample>, AcqError> {
            Err(AcqError::HardwareTimeout {
                line: "Dev1/PFI1".into(),
                timeout: std::time::Duration::from_millis(1),
            })
        }
    }

    #[test]
    fn persistent_laser_timeouts_fail_the_run() {
        let scan = test_scan(16, 2, 1);
        let factory: SourceFactory = Box::new(|_| Ok(Box::new(DeadLaserSource) as BoxedSource));
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Failed);
    }

    #[test]
    fn overscanned_shaker_still_completes() {
        // Excursion twice the binned travel: every sweep still covers each
        // bin once; the out-of-travel pairs are dropped whole and counted.
        let scan = test_scan(16, 2, 1);
        let mut conf = Conf::builder().load().expect("defaults");
        conf.simulation.shaker_amplitude = 32.0 * scan.shaker_position_step;
        conf.scan = scan.clone();
        let factory = source_factory(&conf).expect("simulated factory");
        let mut session = AcquisitionSession::new(scan).unwrap();
        let rx = session.start(factory).unwrap();
        let stats: Vec<SweepStats> = rx.iter().collect();
        assert_eq!(session.join(), SessionState::Completed);
        assert!(session.snapshot().counts.iter().all(|&c| c == 2));
        // 32 pumped/unpumped pairs per sweep, 16 of them outside the travel.
        assert_eq!(stats[0].shots, 64);
        assert_eq!(stats[0].out_of_range, 32);
    }

    #[test]
    fn persistent_trigger_timeouts_fail_the_run() {
        let scan = test_scan(16, 2, 1);
        let factory: SourceFactory =
            Box::new(|_| Ok(Box::new(DeadTriggerSource) as BoxedSource));
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Failed);
    }

    #[test]
    fn all_workers_failing_fails_the_run() {
        let scan = test_scan(16, 2, 2);
        let factory: SourceFactory =
            Box::new(|_| Ok(Box::new(BrokenSource) as BoxedSource));
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Failed);
    }

    #[test]
    fn one_broken_worker_does_not_sink_the_run() {
        let scan = test_scan(16, 3, 2);
        let sim = simulated_factory(&scan);
        // Worker 0 dies on its first read; worker 1 carries the run.
        let factory: SourceFactory = Box::new(move |worker| {
            if worker == 0 {
                Ok(Box::new(BrokenSource) as BoxedSource)
            } else {
                sim(worker)
            }
        });
        let mut session = AcquisitionSession::new(scan).unwrap();
        drop(session.start(factory).unwrap());
        assert_eq!(session.join(), SessionState::Completed);
    }
}
