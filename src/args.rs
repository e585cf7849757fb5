//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use thrust_stand::{pipeline::OutputStage, sample::DecimalSeparator};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Tab separated `<time>\t<value>` log written by the acquisition process
    #[clap(short, long, default_value = "data.txt")]
    pub log: PathBuf,
    /// Decimal mark used in the log
    #[clap(long, value_enum, default_value = "comma")]
    pub decimal: DecimalSeparator,
    /// Multiplier from logged units to micrometres
    #[clap(long, default_value_t = thrust_stand::DEFAULT_RAW_SCALE, value_parser = raw_scale)]
    pub raw_scale: f64,
    #[clap(flatten)]
    pub calibration: Calibration,
    #[clap(subcommand)]
    pub command: Command,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

#[derive(ClapArgs, Debug)]
pub struct Calibration {
    /// Torsional stiffness k (N·m/rad)
    #[clap(long, default_value_t = 0.0125)]
    pub stiffness: f64,
    /// Distance from pivot to thruster (m)
    #[clap(long, default_value_t = 0.25)]
    pub thrust_arm: f64,
    /// Distance from pivot to displacement sensor (m)
    #[clap(long, default_value_t = 0.3)]
    pub sensor_arm: f64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow the growing log and report the live thrust signal
    Monitor {
        /// Seconds of data per refresh
        #[clap(long, default_value_t = thrust_stand::DEFAULT_WINDOW_SECS)]
        window: f64,
        /// Low-pass cutoff (Hz)
        #[clap(long, default_value_t = thrust_stand::DEFAULT_CUTOFF_HZ)]
        cutoff: f64,
        /// Butterworth order
        #[clap(long, default_value_t = 5)]
        #[clap(value_parser = clap::value_parser!(u16).range(1..))]
        order: u16,
        /// Leading samples averaged into the warm-up bias
        #[clap(long, default_value_t = thrust_stand::DEFAULT_WARMUP_SAMPLES)]
        warmup_samples: usize,
        /// Samples needed before the sampling rate is trusted
        #[clap(long, default_value_t = thrust_stand::DEFAULT_MIN_RATE_SAMPLES)]
        min_samples: usize,
        /// Buffers shorter than this are shown unfiltered
        #[clap(long, default_value_t = thrust_stand::DEFAULT_MIN_FILTER_POINTS)]
        min_filter_points: usize,
        /// Refreshes before the bias switches to a rolling average
        #[clap(long, default_value_t = thrust_stand::DEFAULT_HISTORY_THRESHOLD)]
        history_threshold: usize,
        /// Refreshes in the rolling bias average
        #[clap(long, default_value_t = thrust_stand::DEFAULT_ROLLING_WINDOW)]
        rolling_window: usize,
        /// Re-estimate the sampling rate every N refreshes
        #[clap(long)]
        reestimate_every: Option<u64>,
        /// Refresh period (ms)
        #[clap(long, default_value_t = 50)]
        #[clap(value_parser = clap::value_parser!(u64).range(1..))]
        tick_ms: u64,
        /// How long to wait for the log to appear (s)
        #[clap(long, default_value_t = 30)]
        ready_timeout: u64,
        /// Samples kept in memory
        #[clap(long, default_value_t = 1_000_000)]
        max_samples: usize,
        #[clap(long, value_enum, default_value = "thrust")]
        stage: OutputStage,
    },
    /// Summarize a finished log
    Analyze {
        /// Low-pass cutoff (Hz)
        #[clap(long, default_value_t = thrust_stand::DEFAULT_ANALYSIS_CUTOFF_HZ)]
        cutoff: f64,
        /// Butterworth order
        #[clap(long, default_value_t = 5)]
        #[clap(value_parser = clap::value_parser!(u16).range(1..))]
        order: u16,
        /// Leading samples averaged into the bias
        #[clap(long, default_value_t = thrust_stand::DEFAULT_BIAS_LEAD)]
        bias_lead: usize,
        /// Trailing samples treated as steady state
        #[clap(long, default_value_t = thrust_stand::DEFAULT_STEADY_TAIL)]
        steady_tail: usize,
        /// Samples needed to trust the sampling rate
        #[clap(long, default_value_t = thrust_stand::DEFAULT_MIN_RATE_SAMPLES)]
        min_samples: usize,
        /// Rest window as `start:end` seconds, for a static deflection reading
        #[clap(long, value_parser = time_window)]
        baseline: Option<(f64, f64)>,
        /// Loaded window as `start:end` seconds, for a static deflection reading
        #[clap(long, value_parser = time_window)]
        plateau: Option<(f64, f64)>,
        #[clap(long, value_enum, default_value = "thrust")]
        stage: OutputStage,
    },
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn raw_scale(s: &str) -> Result<f64, String> {
    let scale: f64 = s.trim().parse().map_err(|_| "Invalid scale".to_string())?;
    if !scale.is_finite() || scale == 0.0 {
        return Err("Scale must be finite and non-zero".to_string());
    }
    Ok(scale)
}

fn time_window(s: &str) -> Result<(f64, f64), String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| "Expected start:end".to_string())?;
    let start: f64 = start.trim().parse().map_err(|_| "Invalid start time".to_string())?;
    let end: f64 = end.trim().parse().map_err(|_| "Invalid end time".to_string())?;
    if end < start {
        return Err("Window ends before it starts".to_string());
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window() {
        assert_eq!(time_window("150:280"), Ok((150.0, 280.0)));
        assert!(time_window("280:150").is_err());
        assert!(time_window("150").is_err());
    }

    #[test]
    fn test_raw_scale() {
        assert_eq!(raw_scale("1000"), Ok(1000.0));
        assert_eq!(raw_scale("-1"), Ok(-1.0));
        assert!(raw_scale("0").is_err());
        assert!(raw_scale("NaN").is_err());
        assert!(raw_scale("inf").is_err());
        assert!(Args::try_parse_from(["thrust_stand", "--raw-scale", "0", "analyze"]).is_err());
    }

    #[test]
    fn test_parse_monitor() {
        let args = Args::parse_from([
            "thrust_stand",
            "--log",
            "run.txt",
            "--stiffness",
            "0.15",
            "monitor",
            "--stage",
            "displacement",
        ]);
        assert_eq!(args.log, PathBuf::from("run.txt"));
        assert_eq!(args.decimal, DecimalSeparator::Comma);
        assert_eq!(args.calibration.stiffness, 0.15);
        match args.command {
            Command::Monitor { stage, order, .. } => {
                assert_eq!(stage, OutputStage::Displacement);
                assert_eq!(order, 5);
            }
            _ => panic!("expected monitor"),
        }
    }
}
