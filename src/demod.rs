use crate::{DemodPoint, Sample};

/// Reference voltages below this are treated as a dead channel and skip
/// the `use_r0` normalization for that pair.
const MIN_REFERENCE: f64 = 1e-9;

/// Splits the shot stream into pumped/unpumped pairs and emits the
/// differential signal.
///
/// Shots alternate at the laser-trigger cadence with the pumped shot first,
/// so pairing is purely positional. A trailing unpaired shot is buffered and
/// completed by the next `push`, which keeps pairing correct across batch
/// boundaries. With dark control off every shot passes through unchanged.
///
/// Each shot arrives with the bin index the Position Binner assigned to it
/// (`None` when the shaker was out of travel). The pair lands in the pumped
/// shot's bin; a pair whose pumped shot was out of travel is dropped whole.
#[derive(Debug)]
pub struct Demodulator {
    dark_control: bool,
    use_r0: bool,
    pending: Option<(Option<usize>, Sample)>,
    dropped: u64,
}

impl Demodulator {
    pub fn new(dark_control: bool, use_r0: bool) -> Self {
        Self {
            dark_control,
            use_r0,
            pending: None,
            dropped: 0,
        }
    }

    /// Feed one binned shot; returns a point once a full pair (or, without
    /// dark control, a single in-travel shot) is available.
    pub fn push(&mut self, bin: Option<usize>, sample: Sample) -> Option<DemodPoint> {
        if !self.dark_control {
            let Some(bin) = bin else {
                self.dropped += 1;
                return None;
            };
            return Some(DemodPoint {
                bin,
                value: sample.signal,
                dark: 0.0,
                reference: sample.reference,
            });
        }

        match self.pending.take() {
            None => {
                self.pending = Some((bin, sample));
                None
            }
            Some((pumped_bin, pumped)) => {
                let Some(bin) = pumped_bin else {
                    // Both shots of the pair are lost.
                    self.dropped += 2;
                    return None;
                };
                let diff = pumped.signal - sample.signal;
                let value = if self.use_r0 && pumped.reference.abs() > MIN_REFERENCE {
                    diff / pumped.reference
                } else {
                    diff
                };
                Some(DemodPoint {
                    bin,
                    value,
                    dark: sample.signal,
                    reference: pumped.reference,
                })
            }
        }
    }

    /// True while an unpaired pumped shot is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Shots discarded so far. An unpumped shot out of travel does not count
    /// as long as its pair still merges through the pumped shot's bin.
    pub fn dropped_shots(&self) -> u64 {
        self.dropped
    }

    /// Drop any buffered shot, e.g. when a new sweep starts after a restart.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
