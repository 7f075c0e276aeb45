use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::utils::DynError;

pub const SPEED_OF_LIGHT: f64 = 0.299792458; // metres per nanosecond
pub const NUMBER_OF_CHANNELS: usize = 8;
pub const ANTENNAS_PER_POLARITY: usize = 4;
pub const AZIMUTH_OFFSET_DEG: f64 = 75.0; // antenna frame bearing relative to true north
pub const COINCIDENCE_PROXIMITY: f64 = 500.0; // ns between interval begins
pub const MAX_SIGNAL_DURATION: f64 = 300.0; // ns
pub const SIGNAL_THRESHOLD_FRACTION: f64 = 0.5;
pub const DEFAULT_BIN_RANGE: usize = 20;
pub const DEFAULT_WINDOW: (f64, f64) = (-2000.0, 100.0);
pub const DEFAULT_COSMIC_WINDOW: (f64, f64) = (-1500.0, 0.0);
// Arrival-time span for logging individual directions as cosmic-ray candidates.
pub const DEFAULT_DIRECTION_COSMIC_WINDOW: (f64, f64) = (-2000.0, 0.0);

// MiniK survey frame, metres.
pub const ANTENNA_POSITIONS: [[f64; 3]; ANTENNAS_PER_POLARITY] = [
    [-9.5127, -1.3129, 0.001],
    [-0.3003, 24.6127, 0.001],
    [8.0528, 28.1278, 0.0],
    [11.3887, 20.8345, 0.0],
];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unsupported channel count {0}: expected 8 (4 antennas x 2 polarities)")]
    UnsupportedChannelCount(usize),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayConfig {
    pub speed_of_light: f64,
    pub channel_count: usize,
    pub antennas: [[f64; 3]; ANTENNAS_PER_POLARITY],
    pub azimuth_offset_deg: f64,
    pub coincidence_proximity: f64,
    pub max_signal_duration: f64,
    pub signal_threshold_fraction: f64,
    pub bin_range: usize,
    /// Inclusive analysis window on the rounded time axis; `None` keeps the whole capture.
    pub window: Option<(f64, f64)>,
    pub cosmic_window: (f64, f64),
    pub direction_cosmic_window: (f64, f64),
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            speed_of_light: SPEED_OF_LIGHT,
            channel_count: NUMBER_OF_CHANNELS,
            antennas: ANTENNA_POSITIONS,
            azimuth_offset_deg: AZIMUTH_OFFSET_DEG,
            coincidence_proximity: COINCIDENCE_PROXIMITY,
            max_signal_duration: MAX_SIGNAL_DURATION,
            signal_threshold_fraction: SIGNAL_THRESHOLD_FRACTION,
            bin_range: DEFAULT_BIN_RANGE,
            window: Some(DEFAULT_WINDOW),
            cosmic_window: DEFAULT_COSMIC_WINDOW,
            direction_cosmic_window: DEFAULT_DIRECTION_COSMIC_WINDOW,
        }
    }
}

impl ArrayConfig {
    /// Minimum cluster size, ceil(N / 2).
    pub fn half_channel_threshold(&self) -> usize {
        self.channel_count.div_ceil(2)
    }

    /// Unit-step slots covered by the analysis window.
    pub fn window_len(&self) -> Option<usize> {
        self.window.map(|(start, end)| (end - start).round().max(0.0) as usize + 1)
    }

    pub fn antenna_for_channel(&self, channel: usize) -> Option<[f64; 3]> {
        self.antennas.get(antenna_index(channel)).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_count != NUMBER_OF_CHANNELS {
            return Err(ConfigError::UnsupportedChannelCount(self.channel_count));
        }
        if !(self.speed_of_light.is_finite() && self.speed_of_light > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "speed_of_light",
                reason: format!("{} is not a positive finite speed", self.speed_of_light),
            });
        }
        if self.bin_range == 0 {
            return Err(ConfigError::InvalidValue {
                key: "bin_range",
                reason: "must be at least one sample".to_string(),
            });
        }
        if !(self.coincidence_proximity.is_finite() && self.coincidence_proximity > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "coincidence_proximity",
                reason: format!("{} is not a positive finite time", self.coincidence_proximity),
            });
        }
        if !(self.max_signal_duration.is_finite() && self.max_signal_duration > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "max_signal_duration",
                reason: format!("{} is not a positive finite time", self.max_signal_duration),
            });
        }
        if !(self.signal_threshold_fraction > 0.0 && self.signal_threshold_fraction < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "signal_threshold_fraction",
                reason: format!("{} is outside (0, 1)", self.signal_threshold_fraction),
            });
        }
        if let Some((start, end)) = self.window {
            if end <= start {
                return Err(ConfigError::InvalidValue {
                    key: "window",
                    reason: format!("end {end} is not after start {start}"),
                });
            }
        }
        Ok(())
    }
}

// Even channels map to 2k, odd channels to 2k + 1.
pub fn antenna_index(channel: usize) -> usize {
    if channel % 2 == 0 {
        channel / 2
    } else {
        (channel - 1) / 2
    }
}

fn parse_optional_f64(params: &HashMap<String, String>, keys: &[&str]) -> Result<Option<f64>, DynError> {
    for key in keys {
        if let Some(value) = params.get(*key) {
            return Ok(Some(value.trim().parse::<f64>()?));
        }
    }
    Ok(None)
}

fn parse_optional_usize(params: &HashMap<String, String>, keys: &[&str]) -> Result<Option<usize>, DynError> {
    for key in keys {
        if let Some(value) = params.get(*key) {
            return Ok(Some(value.trim().parse::<usize>()?));
        }
    }
    Ok(None)
}

fn parse_xyz_triplet(raw: &str) -> Result<[f64; 3], DynError> {
    let values: Vec<f64> = raw
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != 3 {
        return Err("antenna xyz must contain exactly 3 values".into());
    }
    Ok([values[0], values[1], values[2]])
}

fn parse_antenna(params: &HashMap<String, String>, index: usize) -> Result<Option<[f64; 3]>, DynError> {
    for key in [format!("ant{index}xyz"), format!("a{index}")] {
        if let Some(v) = params.get(&key) {
            return Ok(Some(parse_xyz_triplet(v)?));
        }
    }
    let x = parse_optional_f64(params, &[format!("ant{index}x").as_str()])?;
    let y = parse_optional_f64(params, &[format!("ant{index}y").as_str()])?;
    let z = parse_optional_f64(params, &[format!("ant{index}z").as_str()])?;
    Ok(match (x, y, z) {
        (Some(xv), Some(yv), Some(zv)) => Some([xv, yv, zv]),
        (None, None, None) => None,
        _ => return Err(format!("antenna {index} needs all of x, y and z").into()),
    })
}

fn read_params(path: &Path) -> Result<HashMap<String, String>, DynError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut params = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(index) = line.find('=') {
            let (key, value) = line.split_at(index);
            let key = key.trim().to_ascii_lowercase().replace(['_', '-'], "");
            let value = value
                .trim_start_matches('=')
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            params.insert(key, value);
        }
    }
    Ok(params)
}

/// Applies a `key = value` station file on top of `base`. Unknown keys are ignored.
pub fn apply_config_file(base: ArrayConfig, path: &Path) -> Result<ArrayConfig, DynError> {
    let params = read_params(path)?;
    let mut cfg = base;

    if let Some(c) = parse_optional_f64(&params, &["speedoflight", "c"])? {
        cfg.speed_of_light = c;
    }
    if let Some(n) = parse_optional_usize(&params, &["channels", "numberofchannels"])? {
        cfg.channel_count = n;
    }
    for index in 0..ANTENNAS_PER_POLARITY {
        if let Some(xyz) = parse_antenna(&params, index)? {
            cfg.antennas[index] = xyz;
        }
    }
    if let Some(offset) = parse_optional_f64(&params, &["azimuthoffset", "offset"])? {
        cfg.azimuth_offset_deg = offset;
    }
    if let Some(p) = parse_optional_f64(&params, &["coincidenceproximity", "proximity"])? {
        cfg.coincidence_proximity = p;
    }
    if let Some(d) = parse_optional_f64(&params, &["maxsignalduration", "maxduration"])? {
        cfg.max_signal_duration = d;
    }
    if let Some(f) = parse_optional_f64(&params, &["thresholdfraction", "signalthresholdfraction"])? {
        cfg.signal_threshold_fraction = f;
    }
    if let Some(b) = parse_optional_usize(&params, &["binrange", "bin"])? {
        cfg.bin_range = b;
    }

    if params
        .get("window")
        .map(|v| v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("off"))
        .unwrap_or(false)
    {
        cfg.window = None;
    } else {
        let start = parse_optional_f64(&params, &["windowstart", "xmin"])?;
        let end = parse_optional_f64(&params, &["windowend", "xmax"])?;
        if start.is_some() || end.is_some() {
            let (default_start, default_end) = cfg.window.unwrap_or(DEFAULT_WINDOW);
            cfg.window = Some((start.unwrap_or(default_start), end.unwrap_or(default_end)));
        }
    }

    if let Some(start) = parse_optional_f64(&params, &["cosmicstart"])? {
        cfg.cosmic_window.0 = start;
    }
    if let Some(end) = parse_optional_f64(&params, &["cosmicend"])? {
        cfg.cosmic_window.1 = end;
    }
    if let Some(start) = parse_optional_f64(&params, &["directioncosmicstart"])? {
        cfg.direction_cosmic_window.0 = start;
    }
    if let Some(end) = parse_optional_f64(&params, &["directioncosmicend"])? {
        cfg.direction_cosmic_window.1 = end;
    }

    Ok(cfg)
}
