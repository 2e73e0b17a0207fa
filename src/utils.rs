use anyhow::Result;
use std::{
    collections::VecDeque,
    fs::DirEntry,
    path::PathBuf,
    time::{Duration, Instant},
};

/// Tracks shot throughput, with *all-time* counters and a
/// *sliding 1 s window* rate for the status display.
#[derive(Debug)]
pub struct RateMeter {
    /// All-time number of shots
    pub total_shots: usize,
    /// All-time number of sweeps
    pub n_sweeps: usize,
    /// Time when this meter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    sweeps: VecDeque<(Instant, usize)>,
    shots_in_window: usize,
}

impl Default for RateMeter {
    fn default() -> Self {
        RateMeter {
            total_shots: 0,
            n_sweeps: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            sweeps: VecDeque::new(),
            shots_in_window: 0,
        }
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in kshots/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_shots as f64 / secs) / 1000.0
    }

    /// Sliding-window rate over the last `window` duration (default 1 s),
    /// in kshots/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.shots_in_window as f64 / secs) / 1000.0
    }

    /// Record one processed sweep of `shots` shots.
    pub fn increment(&mut self, shots: usize) {
        let now = Instant::now();

        self.total_shots += shots;
        self.n_sweeps += 1;

        self.sweeps.push_back((now, shots));
        self.shots_in_window += shots;

        // Evict any entries older than `window`
        while let Some(&(ts, n)) = self.sweeps.front() {
            if now.duration_since(ts) > self.window {
                self.sweeps.pop_front();
                self.shots_in_window -= n;
            } else {
                break;
            }
        }
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        self.total_shots = 0;
        self.n_sweeps = 0;
        self.t_begin = Instant::now();
        self.sweeps.clear();
        self.shots_in_window = 0;
    }
}

/// Next free `scanNNN.h5` path under the data directory, creating the
/// directory on first use.
pub fn next_scan_path(data_dir: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(data_dir);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    let scans: Vec<DirEntry> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
    let max_scan = scans
        .iter()
        .filter_map(|entry| {
            entry.file_name().to_str().and_then(|name| {
                name.strip_prefix("scan")?
                    .strip_suffix(".h5")?
                    .parse::<usize>()
                    .ok()
            })
        })
        .max();

    let next = max_scan.map_or(0, |n| n + 1);
    Ok(dir.join(format!("scan{next:03}.h5")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_meter_counts_shots_and_sweeps() {
        let mut meter = RateMeter::new();
        meter.increment(100);
        meter.increment(100);
        assert_eq!(meter.total_shots, 200);
        assert_eq!(meter.n_sweeps, 2);
        assert!(meter.rate() > 0.0);
        meter.reset();
        assert_eq!(meter.total_shots, 0);
        assert!((meter.rate()).abs() < 1e-12);
    }

    #[test]
    fn scan_paths_never_collide() {
        let dir = std::env::temp_dir().join(format!("fastscan-paths-{}", std::process::id()));
        let dir_str = dir.to_str().unwrap().to_owned();
        let first = next_scan_path(&dir_str).unwrap();
        assert!(first.ends_with("scan000.h5"));
        std::fs::write(&first, b"").unwrap();
        let second = next_scan_path(&dir_str).unwrap();
        assert!(second.ends_with("scan001.h5"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
