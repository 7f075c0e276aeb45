use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::DynError;

/// One digitizer trigger: a shared time axis (ns) and one sample series per channel (mV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub row: u64,
    /// Trigger time, unix seconds.
    pub timestamp: f64,
    pub time: Vec<f64>,
    pub channels: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_range: Option<usize>,
}

/// Reads JSON-lines capture files; blank lines and `#` lines are skipped.
pub struct CaptureReader<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, DynError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = Result<CaptureEvent, DynError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some(
                serde_json::from_str::<CaptureEvent>(trimmed)
                    .map_err(|e| format!("capture line {}: {e}", self.line_no).into()),
            );
        }
    }
}

pub fn read_captures(path: &Path) -> Result<Vec<CaptureEvent>, DynError> {
    CaptureReader::open(path)?.collect()
}
