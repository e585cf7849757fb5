use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use args::{Args, Command};
use clap::Parser;
use crossbeam_channel::bounded;
use thrust_stand::{
    analysis::{analyze, AnalysisConfig},
    capture::{read_log, wait_until_ready, LogSource},
    convert::CalibrationModel,
    metrics::MetricsExtractor,
    monitoring::{print_refreshes, run_monitor},
    pipeline::{PipelineConfig, WindowedPipeline},
    Result, DEFAULT_FAILURE_WARN,
};
use tracing::{error, info};

mod args;

// How often to look for the log before the first sample
const READY_POLL: Duration = Duration::from_millis(500);
// Refreshes buffered for the display thread
const DISPLAY_CAPACITY: usize = 4;

fn run(args: Args) -> Result<()> {
    // Geometry is checked before anything touches the data
    let calibration = CalibrationModel::new(
        args.calibration.stiffness,
        args.calibration.thrust_arm,
        args.calibration.sensor_arm,
    )?;

    match args.command {
        Command::Monitor {
            window,
            cutoff,
            order,
            warmup_samples,
            min_samples,
            min_filter_points,
            history_threshold,
            rolling_window,
            reestimate_every,
            tick_ms,
            ready_timeout,
            max_samples,
            stage,
        } => {
            let config = PipelineConfig {
                window_secs: window,
                warmup_samples,
                min_rate_samples: min_samples,
                filter_order: order as usize,
                cutoff_hz: cutoff,
                min_filter_points,
                history_threshold,
                rolling_window,
                raw_scale: args.raw_scale,
                stage,
                reestimate_every,
                failure_warn_threshold: DEFAULT_FAILURE_WARN,
            };
            let mut source = LogSource::new(&args.log, args.decimal).with_max_samples(max_samples);
            info!(log = ?args.log, "Waiting for acquisition");
            wait_until_ready(
                &source,
                &args.log,
                Duration::from_secs(ready_timeout),
                READY_POLL,
            )?;

            // Stop polling on ctrl-c
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
                error!("Could not install ctrl-c handler: {e}");
            }

            // Start the display on its own thread
            let (sender, receiver) = bounded(DISPLAY_CAPACITY);
            let display = thread::spawn(move || print_refreshes(receiver));

            let mut pipeline = WindowedPipeline::new(config, calibration);
            let result = run_monitor(
                &mut source,
                &mut pipeline,
                Duration::from_millis(tick_ms),
                &sender,
                &running,
            );
            drop(sender);
            if display.join().is_err() {
                error!("Display thread panicked");
            }
            let stats = result?;
            info!(
                refreshes = stats.refreshes,
                failures = stats.failures,
                dropped_lines = source.dropped(),
                "Session ended"
            );
        }
        Command::Analyze {
            cutoff,
            order,
            bias_lead,
            steady_tail,
            min_samples,
            baseline,
            plateau,
            stage,
        } => {
            let config = AnalysisConfig {
                filter_order: order as usize,
                cutoff_hz: cutoff,
                min_rate_samples: min_samples,
                raw_scale: args.raw_scale,
                stage,
                extractor: MetricsExtractor {
                    bias_lead,
                    steady_tail,
                },
                baseline,
                plateau,
                ..Default::default()
            };
            let buffer = read_log(&args.log, args.decimal)?;
            let report = analyze(&buffer, &calibration, &config)?;
            print!("{report}");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .init();
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}
