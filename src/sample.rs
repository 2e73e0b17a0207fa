/// One synchronized shot from the four analog lines.
///
/// Immutable once read; `t` is the shot time in seconds since the source
/// started, derived from the laser repetition rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: f64,
    pub signal: f64,
    pub darkcontrol: f64,
    pub reference: f64,
    pub t: f64,
}

/// One demodulated contribution, ready to merge into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemodPoint {
    pub bin: usize,
    /// Demodulated signal: pump-probe difference under dark control,
    /// otherwise the raw signal.
    pub value: f64,
    /// Unpumped (background) signal of the pair; zero without dark control.
    pub dark: f64,
    pub reference: f64,
}
