//! Pipeline configuration.
//!
//! [`PipelineConfig`] is a builder that threads the status listener, storage
//! quota, and the coordinator's timing knobs through a conversion job
//! without polluting every function signature.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use upscaler::PipelineConfig;
//!
//! let config = PipelineConfig::new()
//!     .with_window(250)
//!     .with_stall_timeout(Duration::from_secs(2))
//!     .with_storage_quota(Some(8 * 1024 * 1024 * 1024));
//! assert!(config.validate().is_ok());
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::time::Duration;

use crate::demux::DEFAULT_BATCH_SIZE;
use crate::error::{Result, UpscaleError};
use crate::progress::{JobEvent, NoOpListener, StatusListener};

/// Settings for one conversion job.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Receiver of status events.
    pub(crate) listener: Arc<dyn StatusListener>,
    /// Maximum samples between decode submission and encode completion.
    pub window: usize,
    /// Minimum wall-clock time spent per frame.
    pub frame_budget: Duration,
    /// Inactivity after which a stage counts as stalled.
    pub stall_timeout: Duration,
    /// How often the stall alarm is checked.
    pub poll_interval: Duration,
    /// Decoder flushes are only forced when fewer samples than this remain.
    pub decoder_flush_threshold: usize,
    /// Consecutive stall recoveries allowed before the run fails.
    pub max_stall_recoveries: u32,
    /// Samples per demux batch.
    pub demux_batch_size: usize,
    /// Bytes available for the output, if known.
    pub storage_quota: Option<u64>,
}

impl Debug for PipelineConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("PipelineConfig")
            .field("window", &self.window)
            .field("frame_budget", &self.frame_budget)
            .field("stall_timeout", &self.stall_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("decoder_flush_threshold", &self.decoder_flush_threshold)
            .field("max_stall_recoveries", &self.max_stall_recoveries)
            .field("demux_batch_size", &self.demux_batch_size)
            .field("storage_quota", &self.storage_quota)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    /// Default settings: a 1000-sample window, 30 ms per frame, 1 s stall
    /// timeout polled every 100 ms.
    pub fn new() -> Self {
        Self {
            listener: Arc::new(NoOpListener),
            window: 1000,
            frame_budget: Duration::from_millis(30),
            stall_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            decoder_flush_threshold: 10,
            max_stall_recoveries: 10,
            demux_batch_size: DEFAULT_BATCH_SIZE,
            storage_quota: None,
        }
    }

    /// Receive status events.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Set the in-flight window.
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set the per-frame time budget. `Duration::ZERO` disables throttling.
    #[must_use]
    pub fn with_frame_budget(mut self, budget: Duration) -> Self {
        self.frame_budget = budget;
        self
    }

    /// Set the stall timeout.
    #[must_use]
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Set the stall alarm polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the remaining-sample threshold for forced decoder flushes.
    #[must_use]
    pub fn with_decoder_flush_threshold(mut self, threshold: usize) -> Self {
        self.decoder_flush_threshold = threshold;
        self
    }

    /// Set how many consecutive stall recoveries are allowed.
    #[must_use]
    pub fn with_max_stall_recoveries(mut self, attempts: u32) -> Self {
        self.max_stall_recoveries = attempts;
        self
    }

    /// Set the demux batch size.
    #[must_use]
    pub fn with_demux_batch_size(mut self, size: usize) -> Self {
        self.demux_batch_size = size;
        self
    }

    /// Set the storage quota checked before processing starts.
    #[must_use]
    pub fn with_storage_quota(mut self, quota: Option<u64>) -> Self {
        self.storage_quota = quota;
        self
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(UpscaleError::InvalidConfig("window must be at least 1".into()));
        }
        if self.demux_batch_size == 0 {
            return Err(UpscaleError::InvalidConfig("demux batch size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(UpscaleError::InvalidConfig("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        self.listener.on_event(&event);
    }
}
