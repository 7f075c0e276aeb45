// Independent directional sensor (air-shower particle array) used to
// cross-check the radio reconstruction.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::utils::DynError;

pub const DEFAULT_TOLERANCE_S: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferenceDirection {
    pub azimuth_deg: f64,
    pub zenith_deg: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReferenceError {
    #[error("no reference record within {tolerance} s of {timestamp}")]
    NoMatch { timestamp: f64, tolerance: f64 },
    #[error("reference sensor unavailable: {0}")]
    Unavailable(String),
}

pub trait ReferenceSensor: Send + Sync {
    fn find_reference_direction(&self, timestamp: f64) -> Result<ReferenceDirection, ReferenceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoReference;

impl ReferenceSensor for NoReference {
    fn find_reference_direction(&self, _timestamp: f64) -> Result<ReferenceDirection, ReferenceError> {
        Err(ReferenceError::Unavailable("no reference data configured".to_string()))
    }
}

/// Time-sorted reference records; a lookup returns the nearest record
/// within `tolerance` seconds.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    records: Vec<ReferenceDirection>,
    tolerance: f64,
}

impl ReferenceTable {
    pub fn new(mut records: Vec<ReferenceDirection>, tolerance: f64) -> Self {
        records.retain(|r| r.timestamp.is_finite());
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self { records, tolerance }
    }

    /// Reads `timestamp azimuth zenith` rows (whitespace or comma separated, `#` comments).
    pub fn load(path: &Path, tolerance: f64) -> Result<Self, DynError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<f64> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("{}:{}: {e}", path.display(), line_no + 1))?;
            if fields.len() < 3 {
                return Err(format!(
                    "{}:{}: expected timestamp, azimuth and zenith",
                    path.display(),
                    line_no + 1
                )
                .into());
            }
            records.push(ReferenceDirection {
                timestamp: fields[0],
                azimuth_deg: fields[1],
                zenith_deg: fields[2],
            });
        }
        Ok(Self::new(records, tolerance))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ReferenceSensor for ReferenceTable {
    fn find_reference_direction(&self, timestamp: f64) -> Result<ReferenceDirection, ReferenceError> {
        let split = self.records.partition_point(|r| r.timestamp < timestamp);
        let before = split.checked_sub(1).and_then(|i| self.records.get(i));
        let after = self.records.get(split);
        let nearest = match (before, after) {
            (Some(b), Some(a)) => {
                if (timestamp - b.timestamp) <= (a.timestamp - timestamp) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        match nearest {
            Some(r) if (r.timestamp - timestamp).abs() <= self.tolerance => Ok(*r),
            _ => Err(ReferenceError::NoMatch {
                timestamp,
                tolerance: self.tolerance,
            }),
        }
    }
}
