use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ArrayConfig;
use crate::utils::{max_value, mean};

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("envelope has {envelope} values but the time axis has {time}")]
    LengthMismatch { envelope: usize, time: usize },
    #[error("bin range {bin_range} does not fit a series of {len} samples")]
    InvalidBinRange { bin_range: usize, len: usize },
    #[error("channel {0} envelope contains non-finite values")]
    NonFinite(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalInterval {
    pub channel: usize,
    pub begin_time: f64,
    pub end_time: f64,
}

impl SignalInterval {
    pub fn duration(&self) -> f64 {
        self.end_time - self.begin_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorPolicy {
    pub threshold_fraction: f64,
    pub max_duration: f64,
}

impl From<&ArrayConfig> for DetectorPolicy {
    fn from(cfg: &ArrayConfig) -> Self {
        Self {
            threshold_fraction: cfg.signal_threshold_fraction,
            max_duration: cfg.max_signal_duration,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DetectorState {
    Idle,
    InSignal { begin: f64 },
}

/// Slides a `bin_range`-sample mean over the envelope and reports every
/// excursion above `threshold_fraction * (max - mean)` that closes inside
/// the window and lasts less than `max_duration`.
pub fn detect_signals(
    channel: usize,
    envelope: &[f64],
    time: &[f64],
    bin_range: usize,
    policy: DetectorPolicy,
) -> Result<Vec<SignalInterval>, DetectError> {
    if envelope.len() != time.len() {
        return Err(DetectError::LengthMismatch {
            envelope: envelope.len(),
            time: time.len(),
        });
    }
    if bin_range == 0 || bin_range >= time.len() {
        return Err(DetectError::InvalidBinRange {
            bin_range,
            len: time.len(),
        });
    }
    if envelope.iter().any(|v| !v.is_finite()) {
        return Err(DetectError::NonFinite(channel));
    }

    let chan_mean = mean(envelope);
    let threshold = policy.threshold_fraction * (max_value(envelope) - chan_mean);
    let first_time = time[0];
    let last_time = time[time.len() - 1];
    let last_start = time.len() - bin_range - 1;

    let mut intervals = Vec::new();
    let mut state = DetectorState::Idle;
    for i in 0..=last_start {
        let diff = mean(&envelope[i..i + bin_range]) - chan_mean;
        match state {
            DetectorState::Idle => {
                if diff > threshold {
                    state = DetectorState::InSignal { begin: time[i] };
                }
            }
            DetectorState::InSignal { begin } => {
                if diff <= threshold || i == last_start {
                    state = DetectorState::Idle;
                    let end = time[i + bin_range];
                    if begin != first_time
                        && end != last_time
                        && end > begin
                        && end - begin < policy.max_duration
                    {
                        intervals.push(SignalInterval {
                            channel,
                            begin_time: begin,
                            end_time: end,
                        });
                    }
                }
            }
        }
    }
    Ok(intervals)
}
