use std::path::Path;

use clap::{CommandFactory, Parser};
use tracing::{info, warn};

use radio_coincidence::args::Args;
use radio_coincidence::capture::{read_captures, CaptureEvent};
use radio_coincidence::config::{apply_config_file, ArrayConfig};
use radio_coincidence::pipeline::EventPipeline;
use radio_coincidence::reference::{NoReference, ReferenceSensor, ReferenceTable};
use radio_coincidence::report::{init_logging, log_event, log_summary, ReportWriter};
use radio_coincidence::utils::DynError;

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let args = Args::parse();
    args.validate()?;
    init_logging(args.debug, args.log_file.as_deref())?;

    let base = ArrayConfig::default();
    let cfg = match &args.config {
        Some(path) => apply_config_file(base, path)?,
        None => base,
    };
    let cfg = args.apply_overrides(cfg)?;
    cfg.validate()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.cpu)
        .build_global()
        .map_err(|_| "Failed to initialise rayon thread pool")?;

    info!(
        target: "event",
        captures = %args.captures.display(),
        channels = cfg.channel_count,
        bin_range = cfg.bin_range,
        window = ?cfg.window,
        cpu = args.cpu,
        "starting coincidence analysis"
    );
    for (index, antenna) in cfg.antennas.iter().enumerate() {
        info!(target: "event", antenna = index, position = ?antenna, "antenna");
    }

    let events = read_captures(&args.captures)?;
    if events.is_empty() {
        warn!(target: "event", captures = %args.captures.display(), "no events in capture file");
        return Ok(());
    }
    // Without a window the grid follows the first capture's time axis.
    let time_len = cfg
        .window_len()
        .unwrap_or_else(|| events.first().map_or(0, |e| e.time.len()));
    let output = args.output_path();

    match &args.reference {
        Some(path) => {
            let table = ReferenceTable::load(path, args.reference_tolerance)?;
            info!(target: "event", records = table.len(), path = %path.display(), "reference table loaded");
            analyse(cfg, table, &events, time_len, &output)
        }
        None => {
            warn!(target: "event", "no reference data; reference fields stay empty");
            analyse(cfg, NoReference, &events, time_len, &output)
        }
    }
}

fn analyse<S: ReferenceSensor>(
    cfg: ArrayConfig,
    sensor: S,
    events: &[CaptureEvent],
    time_len: usize,
    output: &Path,
) -> Result<(), DynError> {
    let mut pipeline = EventPipeline::new(cfg, sensor, time_len)?;
    let results = pipeline.run(events);

    let mut writer = ReportWriter::create(output)?;
    let mut skipped = 0usize;
    for (event, result) in events.iter().zip(&results) {
        match result {
            Ok(report) => {
                log_event(report);
                writer.write_event(report)?;
            }
            Err(e) => {
                skipped += 1;
                warn!(target: "event", row = event.row, "event skipped: {e}");
            }
        }
    }
    let written = writer.events_written();
    let path = writer.finalize()?;
    info!(
        target: "event",
        written,
        skipped,
        path = %path.display(),
        "report written"
    );
    log_summary(pipeline.accumulator());
    Ok(())
}
