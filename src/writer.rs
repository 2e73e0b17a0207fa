use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use hdf5::types::VarLenUnicode;
use hdf5::{File, Group};
use ndarray::Array1;

use crate::{AcquisitionMode, Conf, Snapshot};

/// Writes one finished (or cancelled) run to an HDF5 file.
///
/// Layout: `/avg/{data, dark, reference, counts, time_axis}` plus the scan
/// settings mirrored under `/settings` so a file is self-describing.
pub struct ScanWriter {
    pub file: File,
}

impl ScanWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self { file })
    }

    pub fn write_snapshot(&self, snapshot: &Snapshot, time_axis: &[f64]) -> Result<()> {
        let group = self.file.create_group("avg")?;
        write_f64(&group, "data", &snapshot.mean)?;
        write_f64(&group, "dark", &snapshot.mean_dark)?;
        write_f64(&group, "reference", &snapshot.mean_reference)?;
        write_f64(&group, "time_axis", time_axis)?;

        let counts = Array1::from(snapshot.counts.clone());
        let ds = group
            .new_dataset::<u32>()
            .shape(counts.len())
            .create("counts")?;
        ds.write(&counts)?;
        Ok(())
    }

    pub fn write_settings(&self, conf: &Conf) -> Result<()> {
        let group = self.file.create_group("settings")?;
        let scan = &conf.scan;
        write_bool(&group, "simulate", scan.simulate)?;
        write_bool(&group, "dark_control", scan.dark_control)?;
        write_bool(&group, "use_r0", scan.use_r0)?;
        write_scalar(&group, "n_samples", scan.n_samples as f64)?;
        write_scalar(&group, "n_averages", f64::from(scan.n_averages))?;
        write_scalar(&group, "n_processors", scan.n_processors as f64)?;
        write_scalar(&group, "shaker_position_step", scan.shaker_position_step)?;
        write_scalar(&group, "shaker_ps_per_step", scan.shaker_ps_per_step)?;
        write_scalar(&group, "laser_rate_hz", scan.laser_rate_hz)?;
        write_scalar(&group, "trigger_timeout_ms", scan.trigger_timeout_ms as f64)?;
        let mode = match scan.acquisition_mode {
            AcquisitionMode::Triggered => "triggered",
            AcquisitionMode::Continuous => "continuous",
        };
        write_str(&group, "acquisition_mode", mode)?;

        let ch = &conf.channels;
        write_str(&group, "shaker_position", &ch.shaker_position)?;
        write_str(&group, "signal", &ch.signal)?;
        write_str(&group, "darkcontrol", &ch.darkcontrol)?;
        write_str(&group, "reference", &ch.reference)?;
        write_str(&group, "shaker_trigger", &ch.shaker_trigger)?;
        write_str(&group, "laser_trigger", &ch.laser_trigger)?;

        let sim = &conf.simulation;
        write_str(&group, "function", &sim.function)?;
        write_scalar(&group, "amplitude", sim.amplitude)?;
        write_scalar(&group, "center_position", sim.center_position)?;
        write_scalar(&group, "fwhm", sim.fwhm)?;
        write_scalar(&group, "offset", sim.offset)?;
        write_scalar(&group, "shaker_amplitude", sim.shaker_amplitude)?;
        write_scalar(&group, "noise", sim.noise)?;
        Ok(())
    }
}

fn write_f64(group: &Group, name: &str, data: &[f64]) -> Result<()> {
    let arr = Array1::from(data.to_vec());
    let ds = group.new_dataset::<f64>().shape(arr.len()).create(name)?;
    ds.write(&arr)?;
    Ok(())
}

fn write_scalar(group: &Group, name: &str, value: f64) -> Result<()> {
    let ds = group.new_dataset::<f64>().create(name)?;
    ds.write_scalar(&value)?;
    Ok(())
}

fn write_bool(group: &Group, name: &str, value: bool) -> Result<()> {
    let ds = group.new_dataset::<bool>().create(name)?;
    ds.write_scalar(&value)?;
    Ok(())
}

fn write_str(group: &Group, name: &str, value: &str) -> Result<()> {
    let ds = group.new_dataset::<VarLenUnicode>().create(name)?;
    ds.write_scalar(&VarLenUnicode::from_str(value)?)?;
    Ok(())
}
