use crate::config::ArrayConfig;
use crate::reference::DEFAULT_TOLERANCE_S;
use crate::utils::DynError;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Multi-channel radio pulse coincidence finder with TDOA arrival-direction reconstruction",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  radio_coincidence --captures run42.jsonl --output run42.report.jsonl\n  radio_coincidence --captures run42.jsonl --config station.cfg --reference shower.txt --reference-tolerance 0.5\n  radio_coincidence --captures run42.jsonl --bin-range 10 --cpu 4 --debug --log-file run42.log\n"
)]
pub struct Args {
    /// JSON-lines capture file (one event per line)
    #[arg(long, visible_alias = "data")]
    pub captures: PathBuf,

    /// Station file with antenna positions and detector settings (key = value)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Reference shower directions (timestamp azimuth zenith per line)
    #[arg(long, visible_alias = "ref")]
    pub reference: Option<PathBuf>,

    /// Maximum |capture - reference| time difference in seconds
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_S)]
    pub reference_tolerance: f64,

    /// Sliding-window width in samples (overrides the station file)
    #[arg(long)]
    pub bin_range: Option<usize>,

    /// Output JSON-lines report (default: <captures>.report.jsonl)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Number of parallel worker threads
    #[arg(long, default_value_t = 2)]
    pub cpu: usize,

    /// Enable debug logging (per-channel summaries, intervals, failed combos)
    #[arg(long)]
    pub debug: bool,

    /// Also write the log to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Command-line values take precedence over the station file.
    pub fn apply_overrides(&self, mut cfg: ArrayConfig) -> Result<ArrayConfig, DynError> {
        if let Some(bin_range) = self.bin_range {
            if bin_range == 0 {
                return Err("--bin-range must be at least 1".into());
            }
            cfg.bin_range = bin_range;
        }
        Ok(cfg)
    }

    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => {
                let mut name = self
                    .captures
                    .file_stem()
                    .map(|s| s.to_os_string())
                    .unwrap_or_default();
                name.push(".report.jsonl");
                self.captures.with_file_name(name)
            }
        }
    }

    pub fn validate(&self) -> Result<(), DynError> {
        if self.cpu == 0 {
            return Err("--cpu must be at least 1".into());
        }
        if !(self.reference_tolerance.is_finite() && self.reference_tolerance >= 0.0) {
            return Err("--reference-tolerance must be a non-negative number of seconds".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Args;
    use crate::config::ArrayConfig;
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn defaults_and_output_name() {
        let args = Args::parse_from(["radio_coincidence", "--captures", "data/run42.jsonl"]);
        assert_eq!(args.cpu, 2);
        assert_eq!(args.reference_tolerance, 1.0);
        assert!(args.validate().is_ok());
        assert_eq!(args.output_path(), PathBuf::from("data/run42.report.jsonl"));
    }

    #[test]
    fn bin_range_overrides_config() {
        let args = Args::parse_from(["radio_coincidence", "--captures", "x.jsonl", "--bin-range", "12"]);
        let cfg = args.apply_overrides(ArrayConfig::default()).unwrap();
        assert_eq!(cfg.bin_range, 12);

        let args = Args::parse_from(["radio_coincidence", "--captures", "x.jsonl", "--bin-range", "0"]);
        assert!(args.apply_overrides(ArrayConfig::default()).is_err());
    }

    #[test]
    fn zero_cpu_is_rejected() {
        let args = Args::parse_from(["radio_coincidence", "--captures", "x.jsonl", "--cpu", "0"]);
        assert!(args.validate().is_err());
    }
}
