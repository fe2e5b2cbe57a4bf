use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::UploaderConfig;
use crate::output::TelemetrySink;
use crate::storage::{BufferStats, SampleBuffer};
use crate::utils::backoff::Backoff;
use crate::utils::error::{WatcherError, WatcherResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BacklogLevel {
    Normal,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    /// Nothing queued.
    Idle,
    Delivered {
        sequence: u64,
        rows: usize,
        duplicate: bool,
    },
    /// The sink is unreachable; try the same batch again after `delay`.
    Retrying { sequence: u64, delay: Duration },
}

/// Moves batches from the sample buffer to the sink, one at a time.
pub struct Uploader {
    buffer: SampleBuffer,
    sink: Arc<dyn TelemetrySink>,
    config: UploaderConfig,
    batch_size: usize,
    backoff: Backoff,
    backlog: BacklogLevel,
    last_delivery: Option<DateTime<Utc>>,
}

impl Uploader {
    pub fn new(buffer: SampleBuffer, sink: Arc<dyn TelemetrySink>, config: UploaderConfig, batch_size: usize) -> Self {
        let backoff = config.retry.backoff();
        Self {
            buffer,
            sink,
            config,
            batch_size,
            backoff,
            backlog: BacklogLevel::Normal,
            last_delivery: None,
        }
    }

    pub fn backlog_level(&self) -> BacklogLevel {
        self.backlog
    }

    pub fn last_delivery(&self) -> Option<DateTime<Utc>> {
        self.last_delivery
    }

    fn level_for(&self, stats: &BufferStats) -> BacklogLevel {
        let ratio = stats.fill_ratio();
        if ratio >= self.config.backlog_error_ratio {
            BacklogLevel::Critical
        } else if ratio >= self.config.backlog_warn_ratio {
            BacklogLevel::Elevated
        } else {
            BacklogLevel::Normal
        }
    }

    /// Drains one batch and tries to deliver it.
    ///
    /// Sink outages come back as `Retrying`; only auth failures and local
    /// storage failures are errors.
    pub async fn step(&mut self) -> WatcherResult<UploadStep> {
        let batch = match self.buffer.drain(self.batch_size).await? {
            Some(batch) => batch,
            None => return Ok(UploadStep::Idle),
        };

        match self.sink.insert_batch(&batch).await {
            Ok(ack) => {
                self.buffer.ack(ack.sequence).await?;
                self.backoff.reset();
                self.last_delivery = Some(Utc::now());
                debug!(
                    "📤 Batch {} delivered to {} ({} rows)",
                    ack.sequence,
                    self.sink.destination(),
                    batch.len()
                );
                self.refresh_backlog(None).await?;
                Ok(UploadStep::Delivered {
                    sequence: ack.sequence,
                    rows: batch.len(),
                    duplicate: ack.duplicate,
                })
            }
            Err(WatcherError::AuthError(reason)) => {
                error!(
                    "🚨 FATAL: sink {} rejected our credentials ({}); uploads stopped",
                    self.sink.destination(),
                    reason
                );
                Err(WatcherError::AuthError(reason))
            }
            Err(e) => {
                let delay = self.backoff.next_delay().unwrap_or(self.config.retry.cap);
                self.refresh_backlog(Some(&e)).await?;
                Ok(UploadStep::Retrying {
                    sequence: batch.sequence,
                    delay,
                })
            }
        }
    }

    async fn refresh_backlog(&mut self, failure: Option<&WatcherError>) -> WatcherResult<()> {
        let stats = self.buffer.stats().await?;
        let level = self.level_for(&stats);

        if level != self.backlog {
            match level {
                BacklogLevel::Normal => info!("✅ Backlog back to normal: {} samples queued", stats.len),
                BacklogLevel::Elevated => warn!(
                    "⚠️  Backlog at {:.0}% of capacity ({} samples)",
                    stats.fill_ratio() * 100.0,
                    stats.len
                ),
                BacklogLevel::Critical => error!(
                    "🚨 Backlog at {:.0}% of capacity ({} samples, {} dropped so far)",
                    stats.fill_ratio() * 100.0,
                    stats.len,
                    stats.overflow_count
                ),
            }
            self.backlog = level;
        }

        if let Some(e) = failure {
            let last_good = self
                .last_delivery
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let failures = self.backoff.failures();
            match level {
                BacklogLevel::Normal => info!(
                    "📡 Upload failed ({}), attempt {}, last delivery {}",
                    e, failures, last_good
                ),
                BacklogLevel::Elevated => warn!(
                    "⚠️  Upload failed ({}), attempt {}, last delivery {}, {} queued",
                    e, failures, last_good, stats.len
                ),
                BacklogLevel::Critical => error!(
                    "❌ Upload failed ({}), attempt {}, last delivery {}, {} queued, {} dropped",
                    e, failures, last_good, stats.len, stats.overflow_count
                ),
            }
        }
        Ok(())
    }

    /// Delivers until `shutdown` flips. Returns early only on auth failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WatcherResult<()> {
        info!("📤 Uploader started, sink {} ({})", self.sink.destination(), self.sink.sink_type());
        let idle = Duration::from_millis(self.config.idle_poll_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.step().await {
                Ok(UploadStep::Delivered { .. }) => continue,
                Ok(UploadStep::Idle) => idle,
                Ok(UploadStep::Retrying { delay, .. }) => delay,
                Err(e @ WatcherError::AuthError(_)) => return Err(e),
                Err(e) => {
                    error!("❌ Uploader storage failure: {}", e);
                    idle
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("🛑 Uploader stopped");
        Ok(())
    }
}
