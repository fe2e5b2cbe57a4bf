use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::devices::TelemetryReader;
use crate::events::{EventSender, UnitEvent};
use crate::link::SerialLink;
use crate::storage::{SampleBuffer, SampleClock};
use crate::utils::error::WatcherResult;

/// One physical link, the reader that understands its device, and the
/// buffer its samples go to. Runs as its own task.
pub struct AcquisitionUnit {
    link: SerialLink,
    reader: Box<dyn TelemetryReader>,
    buffer: SampleBuffer,
    clock: SampleClock,
    events: EventSender,
}

impl AcquisitionUnit {
    pub fn new(link: SerialLink, reader: Box<dyn TelemetryReader>, buffer: SampleBuffer, events: EventSender) -> Self {
        Self {
            link,
            reader,
            buffer,
            clock: SampleClock::new(),
            events,
        }
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    /// Connects (retrying as the link's policy allows) and starts a new
    /// reader session.
    pub async fn connect_session(&mut self) -> WatcherResult<()> {
        self.link.connect().await?;
        self.clock.reset_source(self.reader.source_id());
        self.reader.on_connect(&mut self.link).await
    }

    /// One acquisition pass. Returns how many samples were buffered.
    pub async fn poll_once(&mut self) -> WatcherResult<usize> {
        let outcome = self.reader.acquire(&mut self.link, &mut self.clock).await?;
        let unit = self.link.name().to_string();

        let failures = self.reader.consecutive_failures();
        for error in outcome.rejected {
            let _ = self.events.send(UnitEvent::QualityEvent {
                unit: unit.clone(),
                error,
                consecutive_failures: failures,
            });
        }
        if outcome.escalated {
            warn!("🔁 '{}' escalated to reconnect after repeated bad frames", unit);
        }

        let count = outcome.samples.len();
        if count > 0 {
            self.buffer.push_all(&outcome.samples).await?;
            let _ = self.events.send(UnitEvent::SamplesProduced {
                unit,
                count,
                at: Utc::now(),
            });
        }
        Ok(count)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WatcherResult<()> {
        info!(
            "▶️  Acquisition unit '{}' started ({})",
            self.name(),
            self.reader.device_type()
        );
        let interval = self.reader.poll_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.link.is_connected() {
                tokio::select! {
                    result = self.connect_session() => {
                        if let Err(e) = result {
                            warn!("⚠️  '{}' could not start a session: {}", self.link.name(), e);
                            if !e.is_retriable() {
                                return Err(e);
                            }
                            continue;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_retriable() => {
                    warn!("⚠️  '{}' poll failed: {}", self.link.name(), e);
                }
                Err(e) => {
                    error!("❌ '{}' stopped: {}", self.link.name(), e);
                    self.link.close();
                    return Err(e);
                }
            }

            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.link.close();
        info!("🛑 Acquisition unit '{}' stopped", self.name());
        Ok(())
    }
}
