use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use confique::Config;
use crossbeam_channel::RecvTimeoutError;
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use time::macros::format_description;

use fastscan::{
    next_scan_path, source_factory, AcquisitionSession, Conf, PositionBinner, ScanWriter, Status,
};

#[derive(Parser, Debug)]
#[command(about = "Shaker-synchronized pump-probe acquisition and binning")]
struct Cli {
    /// TOML configuration file; missing file falls back to defaults.
    #[arg(short, long, default_value = "fastscan.toml")]
    config: PathBuf,
    /// Run without the status TUI, logging progress to the terminal.
    #[arg(long)]
    headless: bool,
    /// Output file; defaults to the next scanNNN.h5 under paths.h5_data.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = Conf::builder()
        .file(&cli.config)
        .load()
        .context("loading configuration")?;
    init_logging(&conf.paths.log_file, cli.headless)?;
    info!("configuration loaded from {}", cli.config.display());

    let factory = source_factory(&conf)?;
    let mut session = AcquisitionSession::new(conf.scan.clone())?;
    let rx_stats = session.start(factory)?;

    if cli.headless {
        run_headless(&session, rx_stats);
    } else {
        let mut terminal = ratatui::init();
        let result = Status::new(&session).run(&mut terminal, rx_stats);
        ratatui::restore();
        result?;
    }

    let state = session.join();
    info!("run ended: {state}");

    let snapshot = session.snapshot();
    let path = match cli.output {
        Some(path) => path,
        None => next_scan_path(&conf.paths.h5_data)?,
    };
    let binner = PositionBinner::from_settings(&conf.scan);
    let writer = ScanWriter::create(&path)
        .with_context(|| format!("creating output file {}", path.display()))?;
    writer.write_snapshot(&snapshot, &binner.time_axis())?;
    writer.write_settings(&conf)?;
    info!(
        "wrote {} bins ({} filled) to {}",
        snapshot.counts.len(),
        snapshot.filled_bins(),
        path.display()
    );

    Ok(())
}

fn run_headless(session: &AcquisitionSession, rx_stats: crossbeam_channel::Receiver<fastscan::SweepStats>) {
    let mut last_filled = 0;
    loop {
        match rx_stats.recv_timeout(Duration::from_millis(500)) {
            Ok(stats) => {
                if stats.filled_bins != last_filled {
                    last_filled = stats.filled_bins;
                    info!(
                        "progress: {}/{} bins at target",
                        stats.filled_bins,
                        session.accumulator().n_bins()
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if session.state().is_terminal() {
            break;
        }
    }
}

fn init_logging(log_file: &str, headless: bool) -> Result<()> {
    let file_config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Debug,
        file_config,
        File::create(log_file).with_context(|| format!("creating log file {log_file}"))?,
    )];
    if headless {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}
