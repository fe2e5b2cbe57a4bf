use async_trait::async_trait;
use std::time::Duration;

use crate::link::SerialLink;
use crate::storage::{Sample, SampleClock};
use crate::utils::error::{FrameDecodeError, WatcherResult};

/// Result of one acquisition pass over a link.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub samples: Vec<Sample>,
    /// Frames that were discarded during this pass.
    pub rejected: Vec<FrameDecodeError>,
    /// Set when the reader gave up on the link and invalidated it.
    pub escalated: bool,
}

/// Reader for one kind of telemetry device sitting behind a `SerialLink`.
///
/// Readers never own the port. They borrow the link for one poll and, when
/// too many frames in a row are bad, invalidate it so the unit reconnects.
#[async_trait]
pub trait TelemetryReader: Send {
    fn source_id(&self) -> &str;
    fn device_type(&self) -> &str;
    fn poll_interval(&self) -> Duration;
    fn consecutive_failures(&self) -> u32;

    /// Called after every (re)connect, before the first poll of the session.
    async fn on_connect(&mut self, _link: &mut SerialLink) -> WatcherResult<()> {
        Ok(())
    }

    async fn acquire(&mut self, link: &mut SerialLink, clock: &mut SampleClock) -> WatcherResult<PollOutcome>;
}

/// Consecutive decode failure counter shared by the readers.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Counts one failure. Returns true when the threshold is reached, in
    /// which case the counter starts over.
    pub fn failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            return true;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
