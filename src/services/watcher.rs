use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

use super::acquisition::AcquisitionUnit;
use super::lease::LinkLease;
use super::uploader::Uploader;
use super::watchdog::{AlertSeverity, Watchdog, WatchdogAction, WatchdogInput};
use crate::config::{Config, LinkConfig, ReaderConfig};
use crate::devices::build_reader;
use crate::events::{self, EventSender};
use crate::link::{NativeOpener, PortOpener, SerialLink};
use crate::output::{build_sink, TelemetrySink};
use crate::storage::SampleBuffer;
use crate::utils::error::{WatcherError, WatcherResult};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct UnitTask {
    handle: JoinHandle<WatcherResult<()>>,
    stop: watch::Sender<bool>,
}

impl UnitTask {
    fn abort(self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }
}

/// Runs every acquisition unit, the uploader and the watchdog until
/// shutdown.
pub struct GridWatcher {
    config: Config,
    buffer: SampleBuffer,
    sink: Arc<dyn TelemetrySink>,
    opener: Arc<dyn PortOpener>,
}

impl GridWatcher {
    pub async fn new(mut config: Config) -> WatcherResult<Self> {
        let buffer = SampleBuffer::open(&config.buffer).await?;
        config.watcher_id = buffer.resolve_watcher_id(&config.watcher_id).await?;
        info!("🚀 Initializing {} [{}]", config.watcher_name, config.watcher_id);
        let sink: Arc<dyn TelemetrySink> = Arc::from(build_sink(&config.uploader.sink, &config.watcher_id)?);
        info!("📡 {} link(s), uploading to {} ({})", config.links.len(), sink.destination(), sink.sink_type());
        Ok(Self::with_parts(config, buffer, sink, Arc::new(NativeOpener)))
    }

    pub fn with_parts(config: Config, buffer: SampleBuffer, sink: Arc<dyn TelemetrySink>, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            config,
            buffer,
            sink,
            opener,
        }
    }

    fn spawn_unit(&self, link: &LinkConfig, events: &EventSender) -> UnitTask {
        let serial = SerialLink::new(link.clone(), self.opener.clone(), Some(events.clone()));
        let unit = AcquisitionUnit::new(serial, build_reader(link), self.buffer.clone(), events.clone());
        let (stop, shutdown) = watch::channel(false);
        UnitTask {
            handle: tokio::spawn(unit.run(shutdown)),
            stop,
        }
    }

    /// Links that the firmware updater takes over while it holds the lease:
    /// Module-M links, links discovered by the firmware USB id, and fixed
    /// paths that resolve to the port the updater will open.
    fn shares_firmware_link(&self, link: &LinkConfig) -> bool {
        let firmware = &self.config.firmware;
        if matches!(link.reader, ReaderConfig::ModuleM(_)) {
            return true;
        }
        if link.usb_vid == Some(firmware.usb_vid) && link.usb_pid == Some(firmware.usb_pid) {
            return true;
        }
        match (link.fixed_path(), self.opener.find_by_usb_id(firmware.usb_vid, firmware.usb_pid)) {
            (Some(path), Some(firmware_path)) => same_port(path, &firmware_path),
            _ => false,
        }
    }

    /// Collects unit tasks that ended on their own and reports them to the
    /// watchdog.
    async fn reap_exited(
        units: &mut HashMap<String, UnitTask>,
        watchdog: &mut Watchdog,
        now: Instant,
    ) -> Vec<WatchdogAction> {
        let exited: Vec<String> = units
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        let mut actions = Vec::new();
        for name in exited {
            let task = match units.remove(&name) {
                Some(task) => task,
                None => continue,
            };
            match task.handle.await {
                Ok(Ok(())) => warn!("⚠️  Unit '{}' exited", name),
                Ok(Err(e)) => error!("❌ Unit '{}' exited: {}", name, e),
                Err(e) => error!("🚨 Unit '{}' task panicked: {}", name, e),
            }
            actions.extend(watchdog.handle(&name, WatchdogInput::Exited, now, Utc::now()));
        }
        actions
    }

    pub async fn run<F>(self, shutdown: F) -> WatcherResult<()>
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = events::channel();
        let mut watchdog = Watchdog::new(self.config.watchdog.clone());
        let mut units: HashMap<String, UnitTask> = HashMap::new();
        let lease_path = self.config.watchdog.lease_path.clone();

        let lease_held = LinkLease::is_held(&lease_path);
        for link in &self.config.links {
            watchdog.register(&link.name, Instant::now());
            if lease_held && self.shares_firmware_link(link) {
                watchdog.handle(&link.name, WatchdogInput::LeaseHeld, Instant::now(), Utc::now());
                warn!("⏸️  '{}' not started: firmware update in progress", link.name);
                continue;
            }
            units.insert(link.name.clone(), self.spawn_unit(link, &events_tx));
        }
        let mut lease_held = lease_held;

        let (uploader_stop, uploader_shutdown) = watch::channel(false);
        let uploader = Uploader::new(
            self.buffer.clone(),
            self.sink.clone(),
            self.config.uploader.clone(),
            self.config.buffer.batch_size,
        );
        let mut uploader_task = tokio::spawn(uploader.run(uploader_shutdown));
        let mut uploader_done = false;

        let mut tick = interval(self.config.watchdog.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("✅ Watcher running");
        loop {
            let actions = tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested");
                    break;
                }
                Some(event) = events_rx.recv() => {
                    watchdog.observe(&event, Instant::now(), Utc::now())
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let mut actions = Self::reap_exited(&mut units, &mut watchdog, now).await;
                    let held = LinkLease::is_held(&lease_path);
                    if held != lease_held {
                        lease_held = held;
                        for link in &self.config.links {
                            // Only suspended units react to the release
                            if held && !self.shares_firmware_link(link) {
                                continue;
                            }
                            let input = if held { WatchdogInput::LeaseHeld } else { WatchdogInput::LeaseReleased };
                            actions.extend(watchdog.handle(&link.name, input, now, Utc::now()));
                        }
                    }
                    actions.extend(watchdog.tick(now, Utc::now()));
                    actions
                }
                result = &mut uploader_task, if !uploader_done => {
                    uploader_done = true;
                    match result {
                        Ok(Err(WatcherError::AuthError(reason))) => {
                            error!("🚨 FATAL: uploader stopped, sink refused credentials ({}). Samples keep buffering.", reason);
                        }
                        Ok(Err(e)) => error!("🚨 Uploader stopped: {}", e),
                        Ok(Ok(())) => warn!("⚠️  Uploader exited"),
                        Err(e) => error!("🚨 Uploader task panicked: {}", e),
                    }
                    Vec::new()
                }
            };

            for action in actions {
                self.apply(action, &mut watchdog, &mut units, &events_tx);
            }
        }

        // Stop units first so their last samples are buffered
        for (name, task) in units.drain() {
            let _ = task.stop.send(true);
            match timeout(STOP_TIMEOUT, task.handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("⚠️  Unit '{}' ended with error: {}", name, e),
                Ok(Err(e)) => warn!("⚠️  Unit '{}' task failed: {}", name, e),
                Err(_) => warn!("⚠️  Unit '{}' did not stop within {:?}", name, STOP_TIMEOUT),
            }
        }

        let _ = uploader_stop.send(true);
        if !uploader_done {
            match timeout(STOP_TIMEOUT, &mut uploader_task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("⚠️  Uploader did not stop within {:?}", STOP_TIMEOUT);
                    uploader_task.abort();
                }
            }
        }

        self.buffer.close().await;
        info!("👋 Watcher stopped");
        Ok(())
    }

    fn apply(
        &self,
        action: WatchdogAction,
        watchdog: &mut Watchdog,
        units: &mut HashMap<String, UnitTask>,
        events: &EventSender,
    ) {
        match action {
            WatchdogAction::Restart { unit } | WatchdogAction::Resume { unit } => {
                let link = match self.config.get_link(&unit) {
                    Some(link) => link,
                    None => return,
                };
                if let Some(task) = units.remove(&unit) {
                    task.abort();
                }
                info!("🔄 (Re)starting acquisition unit '{}'", unit);
                units.insert(unit.clone(), self.spawn_unit(link, events));
                watchdog.handle(&unit, WatchdogInput::Relaunched, Instant::now(), Utc::now());
            }
            WatchdogAction::Suspend { unit } => {
                if let Some(task) = units.remove(&unit) {
                    task.abort();
                }
                info!("⏸️  '{}' suspended: firmware updater holds the link", unit);
            }
            WatchdogAction::Alert {
                unit,
                severity,
                message,
                last_good,
                failed_restarts,
            } => {
                let last_good = last_good
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                match severity {
                    AlertSeverity::Warning => warn!(
                        "⚠️  Unit '{}' {}: last good {}, {} failed restarts",
                        unit, message, last_good, failed_restarts
                    ),
                    AlertSeverity::Fatal => error!(
                        "🚨 FATAL: unit '{}' {}: last good {}, {} failed restarts",
                        unit, message, last_good, failed_restarts
                    ),
                }
            }
            WatchdogAction::PowerCycleHint { unit } => {
                error!("🔌 Unit '{}' needs a power cycle of its device; no further restarts", unit);
            }
        }
    }
}

fn same_port(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    // by-id and by-path names are symlinks to the tty node
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
