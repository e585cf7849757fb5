//! In this module, we implement the monitoring loop for a live session.
//! One refresh runs per tick, never two at once: if a refresh overruns, the ticks it
//! covered are skipped rather than queued. Successful refreshes are pushed to a
//! display collaborator over a bounded channel, and dropped if it can't keep up.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, trace};

use crate::{
    capture::SampleSource,
    error::Result,
    pipeline::{Refresh, RefreshOutcome, WindowedPipeline},
};

/// Counters for a finished session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub refreshes: u64,
    pub updates: u64,
    pub not_ready: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
    pub dropped_updates: u64,
}

/// Refresh `pipeline` from `source` every `tick` until `running` is cleared or a
/// fatal error occurs
pub fn run_monitor<S: SampleSource + ?Sized>(
    source: &mut S,
    pipeline: &mut WindowedPipeline,
    tick: Duration,
    sender: &Sender<Refresh>,
    running: &AtomicBool,
) -> Result<MonitorStats> {
    let tick = tick.max(Duration::from_millis(1));
    let mut stats = MonitorStats::default();
    let mut next = Instant::now();
    while running.load(Ordering::SeqCst) {
        stats.refreshes += 1;
        match pipeline.refresh(source)? {
            RefreshOutcome::NotReady {
                required,
                available,
            } => {
                stats.not_ready += 1;
                debug!(required, available, "Waiting for warm-up samples");
            }
            RefreshOutcome::Updated => {
                stats.updates += 1;
                if let Some(refresh) = pipeline.latest() {
                    if sender.try_send(refresh.clone()).is_err() {
                        stats.dropped_updates += 1;
                    }
                }
            }
            RefreshOutcome::Failed => stats.failures += 1,
        }

        next += tick;
        let now = Instant::now();
        if next <= now {
            let missed = ((now - next).as_nanos() / tick.as_nanos()) as u32 + 1;
            stats.skipped_ticks += missed as u64;
            next += tick * missed;
            trace!(missed, "Refresh overran its tick");
        }
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }
    info!(?stats, "Monitoring stopped");
    Ok(stats)
}

/// Print the newest point of every refresh that makes it through the channel
pub fn print_refreshes(receiver: Receiver<Refresh>) {
    for refresh in receiver {
        if let Some((time, value)) = refresh.series.latest() {
            println!(
                "t = {:>10.3} s  {:>12.5} {}  (bias {:.5}, {:?}, {:.2} Hz)",
                time,
                value,
                refresh.series.stage.unit(),
                refresh.bias,
                refresh.bias_mode,
                refresh.sampling_hz
            );
        }
    }
}
