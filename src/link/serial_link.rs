use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::port::{PortOpener, SerialIo};
use crate::config::LinkConfig;
use crate::events::{EventSender, UnitEvent};
use crate::utils::backoff::Backoff;
use crate::utils::error::{WatcherError, WatcherResult};

const IDLE_READ_PAUSE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct LinkState {
    pub device_path: Option<String>,
    pub baud_rate: u32,
    pub status: LinkStatus,
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub source: String,
    pub device_path: Option<String>,
    pub status: LinkStatus,
    pub reconnects: u64,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Sole owner of one serial handle. Readers borrow the link per poll and
/// never close the handle themselves; they can only ask for `invalidate`.
pub struct SerialLink {
    config: LinkConfig,
    opener: Arc<dyn PortOpener>,
    handle: Option<Box<dyn SerialIo>>,
    state: LinkState,
    backoff: Backoff,
    sessions: u64,
    events: Option<EventSender>,
}

impl SerialLink {
    pub fn new(config: LinkConfig, opener: Arc<dyn PortOpener>, events: Option<EventSender>) -> Self {
        let state = LinkState {
            device_path: config.fixed_path().map(str::to_string),
            baud_rate: config.baud_rate,
            status: LinkStatus::Disconnected,
        };
        let backoff = config.reconnect.backoff();
        Self {
            config,
            opener,
            handle: None,
            state,
            backoff,
            sessions: 0,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn status(&self) -> LinkStatus {
        self.state.status
    }

    pub fn is_connected(&self) -> bool {
        self.state.status == LinkStatus::Connected && self.handle.is_some()
    }

    /// Connection session number; increases every time the link (re)connects.
    pub fn session(&self) -> u64 {
        self.sessions
    }

    pub fn reconnects(&self) -> u64 {
        self.sessions.saturating_sub(1)
    }

    /// Single open attempt.
    pub fn open(&mut self) -> WatcherResult<()> {
        self.set_status(LinkStatus::Connecting, None);

        let path = match self.config.fixed_path() {
            Some(path) => path.to_string(),
            None => {
                let (vid, pid) = (
                    self.config.usb_vid.unwrap_or_default(),
                    self.config.usb_pid.unwrap_or_default(),
                );
                match self.opener.find_by_usb_id(vid, pid) {
                    Some(path) => path,
                    None => {
                        let reason = format!("No device with USB id {:04x}:{:04x}", vid, pid);
                        self.set_status(LinkStatus::Disconnected, Some(reason.clone()));
                        return Err(WatcherError::LinkUnavailable(reason));
                    }
                }
            }
        };

        match self.opener.open(&path, &self.config) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state.device_path = Some(path.clone());
                self.sessions += 1;
                self.backoff.reset();
                info!("✅ Link '{}' connected on {} (session {})", self.config.name, path, self.sessions);
                self.set_status(LinkStatus::Connected, None);
                Ok(())
            }
            Err(e) => {
                self.set_status(LinkStatus::Disconnected, Some(e.to_string()));
                Err(match e {
                    WatcherError::LinkUnavailable(_) => e,
                    other => WatcherError::LinkUnavailable(other.to_string()),
                })
            }
        }
    }

    /// Retries `open` with the configured backoff until connected. Only
    /// returns an error when a bounded policy runs out.
    pub async fn connect(&mut self) -> WatcherResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        loop {
            match self.open() {
                Ok(()) => return Ok(()),
                Err(e) => match self.backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            "🔁 Link '{}' unavailable ({}), retry {} in {:?}",
                            self.config.name,
                            e,
                            self.backoff.failures(),
                            delay
                        );
                        sleep(delay).await;
                    }
                    None => {
                        warn!("❌ Link '{}' giving up after {} attempts", self.config.name, self.backoff.failures());
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Reads whatever is available. `Ok(0)` means the port timed out.
    pub fn read(&mut self, buf: &mut [u8]) -> WatcherResult<usize> {
        let handle = self.handle_mut()?;
        match handle.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.lost(format!("Read failed: {}", e))),
        }
    }

    /// Gathers up to `len` bytes, stopping at the deadline. A short result
    /// is returned as-is for the caller to judge.
    pub async fn read_frame(&mut self, len: usize, timeout: Duration) -> WatcherResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::with_capacity(len);
        let mut buffer = [0u8; 256];

        while frame.len() < len && Instant::now() < deadline {
            let want = (len - frame.len()).min(buffer.len());
            let n = self.read(&mut buffer[..want])?;
            if n == 0 {
                sleep(IDLE_READ_PAUSE).await;
                continue;
            }
            frame.extend_from_slice(&buffer[..n]);
        }

        Ok(frame)
    }

    pub fn write(&mut self, data: &[u8]) -> WatcherResult<()> {
        let handle = self.handle_mut()?;
        match handle.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lost(format!("Write failed: {}", e))),
        }
    }

    pub fn clear_input(&mut self) -> WatcherResult<()> {
        let handle = self.handle_mut()?;
        match handle.clear_input() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lost(format!("Clear failed: {}", e))),
        }
    }

    /// Drops the handle and marks the link as failed so the next `connect`
    /// starts a fresh session.
    pub fn invalidate(&mut self, reason: &str) {
        warn!("⚠️  Link '{}' invalidated: {}", self.config.name, reason);
        self.handle = None;
        self.set_status(LinkStatus::Error, Some(reason.to_string()));
    }

    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            info!("✅ Link '{}' closed", self.config.name);
        }
        self.set_status(LinkStatus::Disconnected, None);
    }

    fn handle_mut(&mut self) -> WatcherResult<&mut Box<dyn SerialIo>> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(WatcherError::LinkLost(format!("Link '{}' is not connected", self.config.name))),
        }
    }

    fn lost(&mut self, reason: String) -> WatcherError {
        self.invalidate(&reason);
        WatcherError::LinkLost(reason)
    }

    fn set_status(&mut self, status: LinkStatus, reason: Option<String>) {
        if self.state.status == status {
            return;
        }
        self.state.status = status;
        if let Some(events) = &self.events {
            let _ = events.send(UnitEvent::Link(LinkEvent {
                source: self.config.name.clone(),
                device_path: self.state.device_path.clone(),
                status,
                reconnects: self.reconnects(),
                reason,
                at: Utc::now(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::testing::{MockOpener, ScriptedPort};

    fn link_config() -> LinkConfig {
        LinkConfig {
            name: "meter".to_string(),
            device_path: Some("/dev/ttyUSB0".to_string()),
            ..LinkConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_port_appears() {
        let opener = Arc::new(MockOpener::new());
        opener.fail_next_opens(3);
        opener.push_port(ScriptedPort::new());

        let (tx, mut rx) = events::channel();
        let mut link = SerialLink::new(link_config(), opener.clone(), Some(tx));
        let started = Instant::now();
        link.connect().await.unwrap();

        assert!(link.is_connected());
        assert_eq!(opener.open_attempts(), 4);
        // 1s + 2s + 4s of backoff
        assert!(started.elapsed() >= Duration::from_secs(7));

        let mut saw_connected = false;
        while let Ok(event) = rx.try_recv() {
            if let UnitEvent::Link(e) = event {
                saw_connected |= e.status == LinkStatus::Connected;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn io_error_marks_link_lost_and_emits_event() {
        let opener = Arc::new(MockOpener::new());
        let port = ScriptedPort::new();
        port.fail_reads_with_io_error();
        opener.push_port(port);

        let (tx, mut rx) = events::channel();
        let mut link = SerialLink::new(link_config(), opener, Some(tx));
        link.open().unwrap();

        let mut buf = [0u8; 8];
        let err = link.read(&mut buf).unwrap_err();
        assert!(matches!(err, WatcherError::LinkLost(_)));
        assert_eq!(link.status(), LinkStatus::Error);
        assert!(!link.is_connected());

        let statuses: Vec<LinkStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                UnitEvent::Link(l) => Some(l.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![LinkStatus::Connecting, LinkStatus::Connected, LinkStatus::Error]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_starts_new_session() {
        let opener = Arc::new(MockOpener::new());
        opener.push_port(ScriptedPort::new());
        opener.push_port(ScriptedPort::new());

        let mut link = SerialLink::new(link_config(), opener, None);
        link.connect().await.unwrap();
        assert_eq!(link.session(), 1);
        link.invalidate("stale");
        link.connect().await.unwrap();
        assert_eq!(link.session(), 2);
        assert_eq!(link.reconnects(), 1);
    }

    #[tokio::test]
    async fn discovers_port_by_usb_id() {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM3");
        opener.push_port(ScriptedPort::new());

        let mut link = SerialLink::new(LinkConfig::default(), opener, None);
        link.open().unwrap();
        assert_eq!(link.state().device_path.as_deref(), Some("/dev/ttyACM3"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_frame_returns_short_frame_at_deadline() {
        let opener = Arc::new(MockOpener::new());
        let port = ScriptedPort::new();
        port.push_response(vec![0x01, 0x03]);
        opener.push_port(port);

        let mut link = SerialLink::new(link_config(), opener, None);
        link.open().unwrap();
        let frame = link.read_frame(9, Duration::from_millis(200)).await.unwrap();
        assert_eq!(frame, vec![0x01, 0x03]);
    }
}
