use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::DemodPoint;

/// Upper bound on lock shards; small scans get one bin per shard.
const MAX_SHARDS: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
struct BinAcc {
    sum_value: f64,
    sum_dark: f64,
    sum_reference: f64,
    count: u32,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Accepted,
    /// The bin already holds `n_averages` contributions; the sample is
    /// dropped (non-fatal, counted).
    AtLimit,
}

/// Consistent read-only view of the per-bin averages.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Mean demodulated signal per bin; NaN for bins with no data yet.
    pub mean: Vec<f64>,
    pub mean_dark: Vec<f64>,
    pub mean_reference: Vec<f64>,
    pub counts: Vec<u32>,
}

impl Snapshot {
    pub fn filled_bins(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Shared per-bin accumulator.
///
/// Bins are split into contiguous lock shards so concurrent workers rarely
/// contend on the same mutex; a single global lock would serialize every
/// merge. Sums are commutative, so no cross-worker ordering is needed.
#[derive(Debug)]
pub struct Accumulator {
    shards: Vec<Mutex<Vec<BinAcc>>>,
    shard_len: usize,
    n_bins: usize,
    n_averages: u32,
    /// Bins that have reached the `n_averages` cap.
    filled: AtomicUsize,
    merges: AtomicU64,
    rejected: AtomicU64,
}

impl Accumulator {
    pub fn new(n_bins: usize, n_averages: u32) -> Self {
        let n_shards = n_bins.clamp(1, MAX_SHARDS);
        let shard_len = n_bins.div_ceil(n_shards);
        let shards = (0..n_shards)
            .map(|s| {
                let len = shard_len.min(n_bins - (s * shard_len).min(n_bins));
                Mutex::new(vec![BinAcc::default(); len])
            })
            .collect();
        Self {
            shards,
            shard_len,
            n_bins,
            n_averages,
            filled: AtomicUsize::new(0),
            merges: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    pub fn n_averages(&self) -> u32 {
        self.n_averages
    }

    /// Merge one demodulated point. At most one contribution per sample:
    /// the caller feeds each point exactly once.
    pub fn merge(&self, point: &DemodPoint) -> MergeOutcome {
        debug_assert!(point.bin < self.n_bins);
        let shard = &self.shards[point.bin / self.shard_len];
        let mut bins = shard.lock().unwrap_or_else(|e| e.into_inner());
        let acc = &mut bins[point.bin % self.shard_len];
        if acc.count >= self.n_averages {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return MergeOutcome::AtLimit;
        }
        acc.sum_value += point.value;
        acc.sum_dark += point.dark;
        acc.sum_reference += point.reference;
        acc.count += 1;
        if acc.count == self.n_averages {
            self.filled.fetch_add(1, Ordering::Relaxed);
        }
        drop(bins);
        self.merges.fetch_add(1, Ordering::Relaxed);
        MergeOutcome::Accepted
    }

    /// Copy out the current means. Each shard is locked only for the length
    /// of its copy, so ongoing merges are never stalled longer than that.
    pub fn snapshot(&self) -> Snapshot {
        let mut mean = Vec::with_capacity(self.n_bins);
        let mut mean_dark = Vec::with_capacity(self.n_bins);
        let mut mean_reference = Vec::with_capacity(self.n_bins);
        let mut counts = Vec::with_capacity(self.n_bins);
        for shard in &self.shards {
            let bins = shard.lock().unwrap_or_else(|e| e.into_inner());
            for acc in bins.iter() {
                if acc.count > 0 {
                    let n = f64::from(acc.count);
                    mean.push(acc.sum_value / n);
                    mean_dark.push(acc.sum_dark / n);
                    mean_reference.push(acc.sum_reference / n);
                } else {
                    mean.push(f64::NAN);
                    mean_dark.push(f64::NAN);
                    mean_reference.push(f64::NAN);
                }
                counts.push(acc.count);
            }
        }
        Snapshot {
            mean,
            mean_dark,
            mean_reference,
            counts,
        }
    }

    /// True once every bin holds `n_averages` contributions.
    pub fn is_complete(&self) -> bool {
        self.filled.load(Ordering::Relaxed) == self.n_bins
    }

    pub fn filled_bins(&self) -> usize {
        self.filled.load(Ordering::Relaxed)
    }

    pub fn total_merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    pub fn rejected_merges(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Clear all bins for a fresh run.
    pub fn reset(&self) {
        for shard in &self.shards {
            let mut bins = shard.lock().unwrap_or_else(|e| e.into_inner());
            bins.fill(BinAcc::default());
        }
        self.filled.store(0, Ordering::Relaxed);
        self.merges.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}
