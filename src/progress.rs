//! Status reporting.
//!
//! A conversion job reports to a [`StatusListener`] through discrete
//! [`JobEvent`]s: progress percentages, ETA strings, at most one error, and
//! the final payload. [`ProgressTracker`] turns sample timestamps into those
//! numbers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use upscaler::{JobEvent, PipelineConfig, StatusListener};
//!
//! struct PrintStatus;
//!
//! impl StatusListener for PrintStatus {
//!     fn on_event(&self, event: &JobEvent) {
//!         match event {
//!             JobEvent::Progress(percent) => println!("{percent}%"),
//!             JobEvent::Eta(eta) => println!("eta {eta}"),
//!             JobEvent::Error(message) => eprintln!("failed: {message}"),
//!             JobEvent::Finished(_) => println!("done"),
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::new().with_listener(Arc::new(PrintStatus));
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Estimated time remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    /// Not enough wall-clock time has passed to extrapolate.
    Calculating,
    /// Linear extrapolation of the current rate.
    Remaining(Duration),
}

impl Display for Eta {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Eta::Calculating => write!(f, "calculating..."),
            Eta::Remaining(left) => write!(f, "{}", pretty_time(left.as_secs())),
        }
    }
}

/// A status update from a conversion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Percent of the declared duration processed, 0 to 100.
    Progress(u8),
    /// Estimated time remaining.
    Eta(Eta),
    /// The job failed. Emitted at most once, and nothing follows it.
    Error(String),
    /// The job finished. Carries the output for in-memory targets and
    /// `None` when the output was streamed to a destination.
    Finished(Option<Bytes>),
}

/// Receiver of [`JobEvent`]s.
///
/// Implementations must be [`Send`] and [`Sync`] so one listener can be
/// shared with UI threads.
pub trait StatusListener: Send + Sync {
    /// Called once per event, in order.
    fn on_event(&self, event: &JobEvent);
}

/// Discards every event. This is the default listener.
pub(crate) struct NoOpListener;

impl StatusListener for NoOpListener {
    fn on_event(&self, _event: &JobEvent) {}
}

/// Forwards events into a channel. Events sent after the receiver is gone
/// are dropped.
impl StatusListener for UnboundedSender<JobEvent> {
    fn on_event(&self, event: &JobEvent) {
        let _ = self.send(event.clone());
    }
}

/// Format whole seconds as `HH:MM:SS`, dropping the hours field when it is
/// zero.
///
/// ```
/// assert_eq!(upscaler::pretty_time(75), "01:15");
/// assert_eq!(upscaler::pretty_time(3725), "01:02:05");
/// ```
pub fn pretty_time(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    if hours == 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// Minimum wall-clock time before an ETA is extrapolated.
pub const ETA_WARMUP: Duration = Duration::from_secs(1);

/// Progress and ETA computation for one run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    total: Duration,
}

impl ProgressTracker {
    /// Start tracking a run over `total` of media.
    pub fn new(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    fn exact_percent(&self, timestamp_us: i64) -> f64 {
        let total = self.total.as_secs_f64();
        if total <= 0.0 {
            return 0.0;
        }
        (timestamp_us as f64 / 1e6) / total * 100.0
    }

    /// Whole percent of the declared duration that `timestamp_us` represents.
    pub fn percent(&self, timestamp_us: i64) -> u8 {
        self.exact_percent(timestamp_us).floor().clamp(0.0, 100.0) as u8
    }

    /// ETA at `timestamp_us` given the time elapsed since the run started.
    pub fn eta_at(&self, timestamp_us: i64, elapsed: Duration) -> Eta {
        if elapsed <= ETA_WARMUP {
            return Eta::Calculating;
        }
        let exact = self.exact_percent(timestamp_us);
        let rate = exact / (elapsed.as_secs_f64() * 1000.0);
        if !rate.is_finite() || rate <= 0.0 {
            return Eta::Calculating;
        }
        let progress = f64::from(self.percent(timestamp_us));
        let secs = ((100.0 - progress) / rate / 1000.0).round().max(0.0);
        Eta::Remaining(Duration::from_secs(secs as u64))
    }

    /// ETA at `timestamp_us`, measured against the run's clock.
    pub fn eta(&self, timestamp_us: i64) -> Eta {
        self.eta_at(timestamp_us, self.started.elapsed())
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
