use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::accumulate::Accumulator;
use crate::capture::CaptureEvent;
use crate::coincidence::{Clusterer, CoincidenceCluster};
use crate::config::{antenna_index, ArrayConfig, ConfigError};
use crate::detect::{detect_signals, DetectError, DetectorPolicy, SignalInterval};
use crate::envelope::{extract_envelope, EnvelopeError};
use crate::geom::{rotate_to_true_north, solve_group, AntennaHit};
use crate::reference::{ReferenceDirection, ReferenceSensor};
use crate::utils::{mean, round_time_axis, window_indices};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("event carries {found} channels, expected {expected}")]
    ChannelCount { expected: usize, found: usize },
    #[error("channel {channel} has {found} samples but the time axis has {expected}")]
    LengthMismatch {
        channel: usize,
        expected: usize,
        found: usize,
    },
    #[error("analysis window [{start}, {end}] is not on the time axis")]
    WindowNotFound { start: f64, end: f64 },
    #[error("channel {channel}: {source}")]
    Envelope {
        channel: usize,
        #[source]
        source: EnvelopeError,
    },
    #[error(transparent)]
    Detect(#[from] DetectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub channel: usize,
    /// Mean of the windowed raw samples.
    pub mean: f64,
    pub peak_time: f64,
    pub peak_value: f64,
    pub interval_count: usize,
}

#[derive(Debug, Clone)]
pub struct ChannelAnalysis {
    pub summary: ChannelSummary,
    pub intervals: Vec<SignalInterval>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeakOrder {
    pub channel: usize,
    pub peak_time: f64,
    /// Delay behind the earliest envelope peak of the event.
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    fn of(channel: usize) -> Self {
        if channel % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionRecord {
    pub channels: [usize; 3],
    pub antennas: [usize; 3],
    pub arrival_times: [f64; 3],
    pub azimuth_deg: Option<f64>,
    pub zenith_deg: Option<f64>,
    /// Reference azimuth after the same true-north rotation.
    pub reference_azimuth_deg: Option<f64>,
    pub reference_zenith_deg: Option<f64>,
    pub success: bool,
    pub failure: Option<String>,
    /// Solved with the first and last arrival inside the direction cosmic-ray window.
    pub cosmic_ray_candidate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParityReport {
    pub parity: Parity,
    pub channels: Vec<usize>,
    /// Empty when fewer than three channels of this parity coincided.
    pub records: Vec<DirectionRecord>,
    pub mean_azimuth_deg: Option<f64>,
    pub mean_zenith_deg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub cluster: CoincidenceCluster,
    pub cosmic_ray_candidate: bool,
    pub reference: Option<ReferenceDirection>,
    pub reference_error: Option<String>,
    pub parities: Vec<ParityReport>,
}

impl ClusterReport {
    pub fn reconstructed(&self) -> bool {
        self.parities
            .iter()
            .any(|p| p.records.iter().any(|r| r.success))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    pub row: u64,
    pub timestamp: f64,
    /// First and last time of the analysed span.
    pub span: (f64, f64),
    pub bin_range: usize,
    pub channels: Vec<ChannelSummary>,
    pub peak_order: Vec<PeakOrder>,
    pub intervals: Vec<SignalInterval>,
    pub clusters: Vec<ClusterReport>,
}

/// Report plus the event's share of the run-wide counters.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub report: EventReport,
    pub tally: Accumulator,
}

pub struct EventPipeline<S> {
    config: ArrayConfig,
    reference: S,
    accumulator: Accumulator,
}

impl<S: ReferenceSensor> EventPipeline<S> {
    pub fn new(config: ArrayConfig, reference: S, time_len: usize) -> Result<Self, PipelineError> {
        config.validate()?;
        let accumulator = Accumulator::new(config.channel_count, time_len);
        Ok(Self {
            config,
            reference,
            accumulator,
        })
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Analyses one event without touching the run-wide counters.
    pub fn process(&self, event: &CaptureEvent) -> Result<EventOutcome, PipelineError> {
        let expected = self.config.channel_count;
        if event.channels.len() != expected {
            return Err(PipelineError::ChannelCount {
                expected,
                found: event.channels.len(),
            });
        }
        for (channel, samples) in event.channels.iter().enumerate() {
            if samples.len() != event.time.len() {
                return Err(PipelineError::LengthMismatch {
                    channel,
                    expected: event.time.len(),
                    found: samples.len(),
                });
            }
        }

        let rounded = round_time_axis(&event.time);
        let (first, last) = match self.config.window {
            Some((start, end)) => window_indices(&rounded, start, end)
                .ok_or(PipelineError::WindowNotFound { start, end })?,
            None if rounded.is_empty() => {
                return Err(PipelineError::Envelope {
                    channel: 0,
                    source: EnvelopeError::Empty,
                })
            }
            None => (0, rounded.len() - 1),
        };
        let time = &rounded[first..=last];
        let bin_range = event.bin_range.unwrap_or(self.config.bin_range);
        let policy = DetectorPolicy::from(&self.config);

        let analyses = event
            .channels
            .par_iter()
            .enumerate()
            .map(|(channel, samples)| {
                analyze_channel(channel, time, &samples[first..=last], bin_range, policy)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let channels: Vec<ChannelSummary> = analyses.iter().map(|a| a.summary).collect();
        let peak_order = peak_ordering(&channels);
        let intervals: Vec<SignalInterval> = analyses
            .iter()
            .flat_map(|a| a.intervals.iter().copied())
            .collect();

        let mut tally = self.accumulator.empty_like();
        tally.events = 1;
        let origin = time[0];

        let clusters: Vec<ClusterReport> = Clusterer::from(&self.config)
            .cluster(&intervals)
            .into_iter()
            .map(|cluster| {
                let report = self.reconstruct_cluster(cluster, event.timestamp);
                tally.clusters += 1;
                if report.cosmic_ray_candidate {
                    tally.cosmic_ray_candidates += 1;
                }
                if report.reconstructed() {
                    tally.reconstructed_clusters += 1;
                    tally.record_histogram(origin, &report.cluster.members, bin_range);
                    tally.record_heatmap(origin, &report.cluster.members);
                    for record in report.parities.iter().flat_map(|p| &p.records) {
                        if let (Some(az), Some(ref_az)) =
                            (record.azimuth_deg, record.reference_azimuth_deg)
                        {
                            tally.record_azimuth_difference(az, ref_az);
                        }
                    }
                }
                report
            })
            .collect();

        Ok(EventOutcome {
            report: EventReport {
                row: event.row,
                timestamp: event.timestamp,
                span: (time[0], time[time.len() - 1]),
                bin_range,
                channels,
                peak_order,
                intervals,
                clusters,
            },
            tally,
        })
    }

    /// Processes a batch in parallel and folds every tally into the run-wide
    /// accumulator. Results keep input order; failed events leave no trace in
    /// the counters.
    pub fn run(&mut self, events: &[CaptureEvent]) -> Vec<Result<EventReport, PipelineError>> {
        let outcomes: Vec<Result<EventOutcome, PipelineError>> =
            events.par_iter().map(|event| self.process(event)).collect();

        let empty = self.accumulator.empty_like();
        let batch = outcomes
            .par_iter()
            .filter_map(|o| o.as_ref().ok())
            .fold(
                || empty.clone(),
                |mut acc, outcome| {
                    acc.merge(&outcome.tally);
                    acc
                },
            )
            .reduce(
                || empty.clone(),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            );
        self.accumulator.merge(&batch);

        outcomes
            .into_iter()
            .map(|o| o.map(|outcome| outcome.report))
            .collect()
    }

    fn reconstruct_cluster(&self, cluster: CoincidenceCluster, timestamp: f64) -> ClusterReport {
        let cfg = &self.config;
        let (reference, reference_error) = match self.reference.find_reference_direction(timestamp) {
            Ok(r) => (Some(r), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let reference_azimuth =
            reference.map(|r| rotate_to_true_north(r.azimuth_deg, cfg.azimuth_offset_deg));

        let mut parities = Vec::new();
        for parity in [Parity::Even, Parity::Odd] {
            let channels: Vec<usize> = cluster
                .channels
                .iter()
                .copied()
                .filter(|&ch| Parity::of(ch) == parity)
                .collect();
            if channels.is_empty() {
                continue;
            }
            let hits: Vec<AntennaHit> = channels
                .iter()
                .filter_map(|&channel| {
                    Some(AntennaHit {
                        channel,
                        antenna: antenna_index(channel),
                        position: cfg.antenna_for_channel(channel)?,
                        arrival_time: cluster.arrival_time(channel)?,
                    })
                })
                .collect();

            let solution = solve_group(&hits, cfg.speed_of_light, cfg.azimuth_offset_deg);
            let records = solution
                .combos
                .into_iter()
                .map(|combo| match combo.result {
                    Ok(direction) => DirectionRecord {
                        channels: combo.channels,
                        antennas: combo.antennas,
                        arrival_times: combo.arrival_times,
                        azimuth_deg: Some(direction.azimuth_deg),
                        zenith_deg: Some(direction.zenith_deg),
                        reference_azimuth_deg: reference_azimuth,
                        reference_zenith_deg: reference.map(|r| r.zenith_deg),
                        success: true,
                        failure: None,
                        cosmic_ray_candidate: within(combo.arrival_times, cfg.direction_cosmic_window),
                    },
                    Err(e) => DirectionRecord {
                        channels: combo.channels,
                        antennas: combo.antennas,
                        arrival_times: combo.arrival_times,
                        azimuth_deg: None,
                        zenith_deg: None,
                        reference_azimuth_deg: None,
                        reference_zenith_deg: None,
                        success: false,
                        failure: Some(e.to_string()),
                        cosmic_ray_candidate: false,
                    },
                })
                .collect();

            parities.push(ParityReport {
                parity,
                channels,
                records,
                mean_azimuth_deg: solution.mean.map(|m| m.0),
                mean_zenith_deg: solution.mean.map(|m| m.1),
            });
        }

        let cosmic_ray_candidate = cluster.within_window(cfg.cosmic_window);
        ClusterReport {
            cluster,
            cosmic_ray_candidate,
            reference,
            reference_error,
            parities,
        }
    }
}

pub fn analyze_channel(
    channel: usize,
    time: &[f64],
    samples: &[f64],
    bin_range: usize,
    policy: DetectorPolicy,
) -> Result<ChannelAnalysis, PipelineError> {
    let envelope =
        extract_envelope(time, samples).map_err(|source| PipelineError::Envelope { channel, source })?;
    let intervals = detect_signals(channel, &envelope.values, time, bin_range, policy)?;
    Ok(ChannelAnalysis {
        summary: ChannelSummary {
            channel,
            mean: mean(samples),
            peak_time: envelope.peak_time,
            peak_value: envelope.peak_value,
            interval_count: intervals.len(),
        },
        intervals,
    })
}

// First and last arrival of a combination against an inclusive window.
fn within(arrival_times: [f64; 3], (start, end): (f64, f64)) -> bool {
    arrival_times[0] >= start && arrival_times[2] <= end
}

/// Channels ordered by envelope peak time; ties keep channel order.
pub fn peak_ordering(channels: &[ChannelSummary]) -> Vec<PeakOrder> {
    let mut ordered: Vec<&ChannelSummary> = channels.iter().collect();
    ordered.sort_by(|a, b| a.peak_time.total_cmp(&b.peak_time));
    let earliest = ordered.first().map(|c| c.peak_time).unwrap_or(0.0);
    ordered
        .into_iter()
        .map(|c| PeakOrder {
            channel: c.channel,
            peak_time: c.peak_time,
            offset: c.peak_time - earliest,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{peak_ordering, ChannelSummary, EventPipeline, Parity, PipelineError};
    use crate::capture::CaptureEvent;
    use crate::config::{ArrayConfig, ANTENNA_POSITIONS, AZIMUTH_OFFSET_DEG, SPEED_OF_LIGHT};
    use crate::geom::{simulate_arrival_times, unit_direction};
    use crate::reference::{NoReference, ReferenceDirection, ReferenceTable};

    const PULSE_BASE: f64 = -900.0;
    const PULSE_WIDTH: i64 = 40;
    const TIMESTAMP: f64 = 1531489715.0;

    fn angle_diff(a: f64, b: f64) -> f64 {
        let d = (a - b).rem_euclid(360.0);
        d.min(360.0 - d)
    }

    // Period-4 carrier locked to each pulse start so every channel carries the
    // same envelope shape shifted by a whole number of samples.
    fn channel_samples(time: &[f64], start: f64, height: f64) -> Vec<f64> {
        const CARRIER: [f64; 4] = [0.0, 1.0, 0.0, -1.0];
        time.iter()
            .map(|&t| {
                let k = (t - start) as i64;
                let amp = if (0..PULSE_WIDTH).contains(&k) { height } else { 1.0 };
                amp * CARRIER[k.rem_euclid(4) as usize]
            })
            .collect()
    }

    fn synthetic_event(azimuth: f64, zenith: f64) -> CaptureEvent {
        let time: Vec<f64> = (-2100..=200).map(|t| t as f64).collect();
        let d = unit_direction(azimuth, zenith, AZIMUTH_OFFSET_DEG);
        let arrivals = simulate_arrival_times(&ANTENNA_POSITIONS, d, PULSE_BASE, SPEED_OF_LIGHT);
        let channels = (0..8)
            .map(|ch| channel_samples(&time, arrivals[ch / 2].round(), 20.0))
            .collect();
        CaptureEvent {
            row: 7,
            timestamp: TIMESTAMP,
            time,
            channels,
            bin_range: Some(10),
        }
    }

    #[test]
    fn synthetic_capture_recovers_direction() {
        let pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();
        let outcome = pipeline.process(&synthetic_event(200.0, 45.0)).unwrap();
        let report = &outcome.report;

        assert_eq!(report.span, (-2000.0, 100.0));
        assert_eq!(report.intervals.len(), 8);
        assert_eq!(report.clusters.len(), 1);
        let cluster = &report.clusters[0];
        assert_eq!(cluster.cluster.channels.len(), 8);
        assert!(cluster.reference.is_none());
        assert!(cluster.reference_error.is_some());

        assert_eq!(cluster.parities.len(), 2);
        for parity in &cluster.parities {
            assert_eq!(parity.records.len(), 4);
            assert!(parity.records.iter().all(|r| r.success), "{parity:?}");
            let az = parity.mean_azimuth_deg.unwrap();
            let zen = parity.mean_zenith_deg.unwrap();
            assert!(angle_diff(az, 200.0) < 5.0, "azimuth {az}");
            assert!((zen - 45.0).abs() < 5.0, "zenith {zen}");
        }
        assert_eq!(cluster.parities[0].parity, Parity::Even);
        assert_eq!(cluster.parities[0].channels, vec![0, 2, 4, 6]);

        let tally = &outcome.tally;
        assert_eq!(tally.events, 1);
        assert_eq!(tally.clusters, 1);
        assert_eq!(tally.reconstructed_clusters, 1);
        assert_eq!(tally.cosmic_ray_candidates, 1);
        assert!(tally.azimuth_differences.is_empty());
        for ch in 0..8 {
            assert_eq!(tally.histogram[ch].iter().sum::<u64>(), 10);
            assert!(tally.heatmap[ch].iter().sum::<u64>() > 0);
        }
    }

    #[test]
    fn reference_match_is_rotated_and_tallied() {
        let table = ReferenceTable::new(
            vec![ReferenceDirection {
                azimuth_deg: 100.0,
                zenith_deg: 40.0,
                timestamp: TIMESTAMP + 0.2,
            }],
            1.0,
        );
        let pipeline = EventPipeline::new(ArrayConfig::default(), table, 2101).unwrap();
        let outcome = pipeline.process(&synthetic_event(30.0, 35.0)).unwrap();
        let cluster = &outcome.report.clusters[0];
        assert!(cluster.reference_error.is_none());
        let record = cluster.parities[0]
            .records
            .iter()
            .find(|r| r.success)
            .unwrap();
        assert!((record.reference_azimuth_deg.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(record.reference_zenith_deg, Some(40.0));
        let successes = cluster
            .parities
            .iter()
            .flat_map(|p| &p.records)
            .filter(|r| r.success)
            .count();
        assert_eq!(outcome.tally.azimuth_differences.len(), successes);
    }

    #[test]
    fn quiet_capture_has_no_clusters() {
        let pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();
        let mut event = synthetic_event(0.0, 20.0);
        for samples in event.channels.iter_mut() {
            samples.fill(0.0);
        }
        let outcome = pipeline.process(&event).unwrap();
        assert!(outcome.report.clusters.is_empty());
        assert_eq!(outcome.tally.events, 1);
        assert_eq!(outcome.tally.clusters, 0);
    }

    #[test]
    fn malformed_events_are_rejected() {
        let pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();

        let mut event = synthetic_event(0.0, 20.0);
        event.channels.pop();
        assert!(matches!(
            pipeline.process(&event),
            Err(PipelineError::ChannelCount { expected: 8, found: 7 })
        ));

        let mut event = synthetic_event(0.0, 20.0);
        event.channels[3].truncate(10);
        assert!(matches!(
            pipeline.process(&event),
            Err(PipelineError::LengthMismatch { channel: 3, .. })
        ));

        let mut event = synthetic_event(0.0, 20.0);
        event.time = event.time.iter().map(|t| t + 5000.0).collect();
        assert!(matches!(
            pipeline.process(&event),
            Err(PipelineError::WindowNotFound { .. })
        ));
    }

    #[test]
    fn unsupported_channel_count_fails_construction() {
        let cfg = ArrayConfig {
            channel_count: 6,
            ..ArrayConfig::default()
        };
        assert!(matches!(
            EventPipeline::new(cfg, NoReference, 10),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn run_keeps_order_and_merges_tallies() {
        let mut pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();
        let mut broken = synthetic_event(0.0, 20.0);
        broken.channels.clear();
        let events = vec![synthetic_event(200.0, 45.0), broken, synthetic_event(120.0, 30.0)];

        let results = pipeline.run(&events);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());

        let acc = pipeline.accumulator();
        assert_eq!(acc.events, 2);
        assert_eq!(acc.clusters, 2);
        assert_eq!(acc.histogram[0].iter().sum::<u64>(), 20);
    }

    #[test]
    fn seven_channel_cluster_solves_one_odd_combination() {
        let pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();
        let mut event = synthetic_event(200.0, 45.0);
        event.channels[7].fill(0.0);
        let outcome = pipeline.process(&event).unwrap();

        assert_eq!(outcome.report.clusters.len(), 1);
        let cluster = &outcome.report.clusters[0];
        assert_eq!(cluster.cluster.channels.iter().copied().collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());

        let even = &cluster.parities[0];
        assert_eq!(even.parity, Parity::Even);
        assert_eq!(even.records.len(), 4);

        let odd = &cluster.parities[1];
        assert_eq!(odd.parity, Parity::Odd);
        assert_eq!(odd.channels, vec![1, 3, 5]);
        assert_eq!(odd.records.len(), 1);
        assert_eq!(odd.records[0].channels, [1, 3, 5]);
        assert_eq!(odd.records[0].antennas, [0, 1, 2]);
        assert!(odd.records[0].success);
        assert!(angle_diff(odd.mean_azimuth_deg.unwrap(), 200.0) < 5.0);
        assert!((odd.mean_zenith_deg.unwrap() - 45.0).abs() < 5.0);
    }

    #[test]
    fn directions_inside_the_arrival_window_are_cosmic_ray_candidates() {
        let pipeline = EventPipeline::new(ArrayConfig::default(), NoReference, 2101).unwrap();
        let outcome = pipeline.process(&synthetic_event(200.0, 45.0)).unwrap();
        for record in outcome.report.clusters[0].parities.iter().flat_map(|p| &p.records) {
            assert!(record.arrival_times.iter().all(|&t| (-2000.0..=0.0).contains(&t)));
            assert!(record.cosmic_ray_candidate);
        }

        let cfg = ArrayConfig {
            direction_cosmic_window: (-500.0, 0.0),
            ..ArrayConfig::default()
        };
        let pipeline = EventPipeline::new(cfg, NoReference, 2101).unwrap();
        let outcome = pipeline.process(&synthetic_event(200.0, 45.0)).unwrap();
        assert!(outcome.report.clusters[0]
            .parities
            .iter()
            .flat_map(|p| &p.records)
            .all(|r| !r.cosmic_ray_candidate));
    }

    #[test]
    fn peaks_are_ordered_by_time() {
        let summary = |channel, peak_time| ChannelSummary {
            channel,
            mean: 0.0,
            peak_time,
            peak_value: 1.0,
            interval_count: 0,
        };
        let order = peak_ordering(&[summary(0, -40.0), summary(1, -90.0), summary(2, -40.0)]);
        let channels: Vec<usize> = order.iter().map(|p| p.channel).collect();
        assert_eq!(channels, vec![1, 0, 2]);
        assert_eq!(order[2].offset, 50.0);
    }
}
