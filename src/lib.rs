pub mod accumulator;
pub mod acquisition;
pub mod binner;
pub mod config;
pub mod demod;
pub mod error;
pub mod sample;
pub mod source;
pub mod tui;
pub mod utils;
pub mod writer;

pub use accumulator::{Accumulator, MergeOutcome, Snapshot};
pub use acquisition::{AcquisitionSession, SessionState, SweepStats};
pub use binner::PositionBinner;
pub use config::{
    AcquisitionMode, ChannelSettings, Conf, PathSettings, ScanSettings, SimulationSettings,
};
pub use demod::Demodulator;
pub use error::AcqError;
pub use sample::{DemodPoint, Sample};
pub use source::{
    hardware_factory, sech2_fwhm, source_factory, BoxedSource, DaqBackend, HardwareSource,
    SampleSource, SimulatedSource, SourceFactory,
};
pub use tui::Status;
pub use utils::{next_scan_path, RateMeter};
pub use writer::ScanWriter;
