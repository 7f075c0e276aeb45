use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::accumulate::Accumulator;
use crate::pipeline::{ClusterReport, EventReport};
use crate::utils::DynError;

/// Installs the global subscriber: stderr always, plus a plain-text copy
/// when `log_file` is given. `RUST_LOG` overrides the level.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<(), DynError> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("failed to install log subscriber: {e}"))?;
    Ok(())
}

/// One JSON object per event, one event per line.
pub struct ReportWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    events_written: usize,
}

impl ReportWriter {
    pub fn create(path: &Path) -> Result<Self, DynError> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            events_written: 0,
        })
    }

    pub fn write_event(&mut self, report: &EventReport) -> Result<(), DynError> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.events_written += 1;
        Ok(())
    }

    pub fn events_written(&self) -> usize {
        self.events_written
    }

    pub fn finalize(mut self) -> Result<PathBuf, DynError> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

pub fn log_event(report: &EventReport) {
    info!(
        target: "event",
        row = report.row,
        timestamp = report.timestamp,
        intervals = report.intervals.len(),
        clusters = report.clusters.len(),
        "event analysed"
    );
    for summary in &report.channels {
        debug!(
            target: "event",
            row = report.row,
            channel = summary.channel,
            mean = summary.mean,
            peak_time = summary.peak_time,
            peak_value = summary.peak_value,
            intervals = summary.interval_count,
            "channel summary"
        );
    }
    let order: Vec<String> = report
        .peak_order
        .iter()
        .map(|p| format!("{}(+{:.0})", p.channel, p.offset))
        .collect();
    debug!(target: "event", row = report.row, order = %order.join(" "), "peak order");
    for interval in &report.intervals {
        debug!(
            target: "event",
            row = report.row,
            channel = interval.channel,
            begin = interval.begin_time,
            end = interval.end_time,
            "signal interval"
        );
    }
    for cluster in &report.clusters {
        log_cluster(report.row, cluster);
    }
}

fn log_cluster(row: u64, cluster: &ClusterReport) {
    let channels: Vec<String> = cluster
        .cluster
        .channels
        .iter()
        .map(|c| c.to_string())
        .collect();
    info!(
        target: "coincidence",
        row,
        channels = %channels.join(","),
        begin = cluster.cluster.begin_time,
        end = cluster.cluster.end_time,
        "coincidence"
    );
    if cluster.cosmic_ray_candidate {
        info!(
            target: "cosmic_ray",
            row,
            channels = %channels.join(","),
            begin = cluster.cluster.begin_time,
            end = cluster.cluster.end_time,
            "cosmic-ray candidate"
        );
    }
    if let Some(err) = &cluster.reference_error {
        warn!(target: "coincidence", row, "reference lookup failed: {err}");
    }

    for parity in &cluster.parities {
        for record in &parity.records {
            match (record.azimuth_deg, record.zenith_deg) {
                (Some(azimuth), Some(zenith)) => {
                    info!(
                        target: "coincidence",
                        row,
                        parity = ?parity.parity,
                        antennas = ?record.antennas,
                        azimuth,
                        zenith,
                        reference_azimuth = ?record.reference_azimuth_deg,
                        reference_zenith = ?record.reference_zenith_deg,
                        "direction"
                    );
                    if record.cosmic_ray_candidate {
                        info!(
                            target: "cosmic_ray",
                            row,
                            antennas = ?record.antennas,
                            arrival_times = ?record.arrival_times,
                            azimuth,
                            zenith,
                            reference_azimuth = ?record.reference_azimuth_deg,
                            reference_zenith = ?record.reference_zenith_deg,
                            "direction"
                        );
                    }
                }
                _ => debug!(
                    target: "coincidence",
                    row,
                    parity = ?parity.parity,
                    antennas = ?record.antennas,
                    reason = record.failure.as_deref().unwrap_or("unknown"),
                    "reconstruction failed"
                ),
            }
        }
        if let (Some(azimuth), Some(zenith)) = (parity.mean_azimuth_deg, parity.mean_zenith_deg) {
            info!(
                target: "coincidence",
                row,
                parity = ?parity.parity,
                azimuth,
                zenith,
                "mean direction"
            );
        }
    }
}

pub fn log_summary(acc: &Accumulator) {
    info!(
        target: "event",
        events = acc.events,
        clusters = acc.clusters,
        reconstructed = acc.reconstructed_clusters,
        cosmic_ray_candidates = acc.cosmic_ray_candidates,
        "run complete"
    );
    let bins = acc.azimuth_difference_bins();
    if !bins.is_empty() {
        let text: Vec<String> = bins
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}-{}:{}", i * 5, i * 5 + 5, n))
            .collect();
        info!(target: "event", bins = %text.join(" "), "azimuth differences");
    }
}
