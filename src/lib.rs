pub mod analysis;
pub mod capture;
pub mod convert;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod monitoring;
pub mod pipeline;
pub mod rate;
pub mod sample;

pub use error::{Error, Result};

// Warm-up
pub const DEFAULT_MIN_RATE_SAMPLES: usize = 200;
pub const DEFAULT_WARMUP_SAMPLES: usize = 200;

// Display window and filtering
pub const DEFAULT_WINDOW_SECS: f64 = 20.0;
pub const DEFAULT_FILTER_ORDER: usize = 5;
// Keeps the balance dynamics visible on the live plot
pub const DEFAULT_CUTOFF_HZ: f64 = 0.5;
// Post-hoc reports trade dynamics for stability
pub const DEFAULT_ANALYSIS_CUTOFF_HZ: f64 = 0.1;
pub const DEFAULT_MIN_FILTER_POINTS: usize = 30;

// Bias bookkeeping, counted in refresh outputs
pub const DEFAULT_HISTORY_THRESHOLD: usize = 1000;
pub const DEFAULT_ROLLING_WINDOW: usize = 200;

// The acquisition logs millimetres
pub const DEFAULT_RAW_SCALE: f64 = 1000.0;

// Metrics, counted in samples
pub const DEFAULT_BIAS_LEAD: usize = 50;
pub const DEFAULT_STEADY_TAIL: usize = 250;

pub const DEFAULT_FAILURE_WARN: u32 = 10;
