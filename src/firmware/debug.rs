use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::target::service_link;
use crate::config::FirmwareConfig;
use crate::link::{PortOpener, SerialLink};
use crate::utils::error::{WatcherError, WatcherResult};

const COMMAND_MAGIC: u8 = b'$';
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const LOG_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_SETTLE: Duration = Duration::from_millis(500);
const LOG_ATTEMPTS: u32 = 5;
const LOG_RETRY_DELAY: Duration = Duration::from_secs(3);
const QUIET_PERIOD: Duration = Duration::from_millis(500);
const READ_POLL: Duration = Duration::from_millis(20);
const EMPTY_LOG_MARKER: &str = "logs are empty";

/// Service commands of the Module-M firmware, sent as `$` and a command
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    Register,
    Options,
    TriggerBootloader,
    /// Prints the flash debug log, then clears it.
    FlashLog,
    StreamMessages,
    EnableFlashLog,
    DisableFlashLog,
    ResetReason,
    /// Calibration table of CT 1, 2 or 3.
    CtCalibration(u8),
    FirmwareVersion,
}

impl DebugCommand {
    pub const NAMES: [&'static str; 10] = [
        "register",
        "options",
        "bootloader",
        "flash-log",
        "stream",
        "flash-log-on",
        "flash-log-off",
        "reset-reason",
        "ct-calibration",
        "version",
    ];

    pub fn parse(name: &str, ct: Option<u8>) -> WatcherResult<Self> {
        let command = match name {
            "register" => DebugCommand::Register,
            "options" => DebugCommand::Options,
            "bootloader" => DebugCommand::TriggerBootloader,
            "flash-log" => DebugCommand::FlashLog,
            "stream" => DebugCommand::StreamMessages,
            "flash-log-on" => DebugCommand::EnableFlashLog,
            "flash-log-off" => DebugCommand::DisableFlashLog,
            "reset-reason" => DebugCommand::ResetReason,
            "ct-calibration" => match ct {
                Some(ct @ 1..=3) => DebugCommand::CtCalibration(ct),
                _ => {
                    return Err(WatcherError::Config(
                        "ct-calibration needs --ct 1, 2 or 3".to_string(),
                    ))
                }
            },
            "version" => DebugCommand::FirmwareVersion,
            other => return Err(WatcherError::Config(format!("Unknown debug command '{}'", other))),
        };
        Ok(command)
    }

    fn code(self) -> u8 {
        match self {
            DebugCommand::Register => b'A',
            DebugCommand::Options => b'C',
            DebugCommand::TriggerBootloader => b'D',
            DebugCommand::FlashLog => b'E',
            DebugCommand::StreamMessages => b'F',
            DebugCommand::EnableFlashLog => b'G',
            DebugCommand::DisableFlashLog => b'H',
            DebugCommand::ResetReason => b'I',
            DebugCommand::CtCalibration(_) => b'J',
            DebugCommand::FirmwareVersion => b'K',
        }
    }

    pub fn encode(self) -> Vec<u8> {
        let mut frame = vec![COMMAND_MAGIC, self.code()];
        // The CT number travels as its ASCII digit
        if let DebugCommand::CtCalibration(ct) = self {
            frame.push(b'0' + ct);
        }
        frame
    }
}

/// Operator access to Module-M's service commands over its USB serial
/// port. Each exchange opens the port, talks, and closes it again.
pub struct DebugSession {
    config: FirmwareConfig,
    opener: Arc<dyn PortOpener>,
}

impl DebugSession {
    pub fn new(config: FirmwareConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self { config, opener }
    }

    /// Sends `command` and returns what the device printed before going
    /// quiet. An empty string means no answer.
    pub async fn send(&self, command: DebugCommand) -> WatcherResult<String> {
        info!("📨 Sending {:?} to Module-M", command);
        self.exchange(&command.encode(), Duration::ZERO, RESPONSE_TIMEOUT).await
    }

    /// Dumps the device debug log, retrying while the device stays silent.
    /// `Ok(None)` means the device reported an empty log.
    pub async fn fetch_logs(&self) -> WatcherResult<Option<String>> {
        let request = DebugCommand::FirmwareVersion.encode();
        for attempt in 1..=LOG_ATTEMPTS {
            info!("🔁 Attempt {}/{}: requesting debug log", attempt, LOG_ATTEMPTS);
            match self.exchange(&request, LOG_SETTLE, LOG_TIMEOUT).await {
                Ok(text) if text.trim().is_empty() => warn!("⚠️  No response received"),
                Ok(text) if text.to_lowercase().contains(EMPTY_LOG_MARKER) => {
                    info!("📭 Module-M reports an empty log");
                    return Ok(None);
                }
                Ok(text) => {
                    info!("✅ Debug log received ({} lines)", text.lines().count());
                    return Ok(Some(text));
                }
                Err(e) => warn!("⚠️  Serial error on attempt {}: {}", attempt, e),
            }
            if attempt < LOG_ATTEMPTS {
                sleep(LOG_RETRY_DELAY).await;
            }
        }
        Err(WatcherError::LinkUnavailable(format!(
            "no debug log after {} attempts",
            LOG_ATTEMPTS
        )))
    }

    async fn exchange(&self, request: &[u8], settle: Duration, timeout: Duration) -> WatcherResult<String> {
        let mut link = service_link(&self.config, self.opener.clone());
        link.open()?;
        let result = match link.clear_input().and_then(|_| link.write(request)) {
            Ok(()) => {
                sleep(settle).await;
                read_until_quiet(&mut link, timeout).await
            }
            Err(e) => Err(e),
        };
        link.close();
        result
    }
}

/// Reads until the device has been silent for a moment after answering,
/// or until `timeout` passes.
async fn read_until_quiet(link: &mut SerialLink, timeout: Duration) -> WatcherResult<String> {
    let deadline = Instant::now() + timeout;
    let mut received = Vec::new();
    let mut last_data: Option<Instant> = None;
    let mut buffer = [0u8; 256];

    while Instant::now() < deadline {
        let n = link.read(&mut buffer)?;
        if n > 0 {
            received.extend_from_slice(&buffer[..n]);
            last_data = Some(Instant::now());
            continue;
        }
        if matches!(last_data, Some(at) if at.elapsed() >= QUIET_PERIOD) {
            break;
        }
        sleep(READ_POLL).await;
    }
    Ok(String::from_utf8_lossy(&received).into_owned())
}

/// Writes a retrieved log to `path`, creating its directory.
pub fn save_log<P: AsRef<Path>>(path: P, log: &str) -> WatcherResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path.as_ref(), log)?;
    info!("💾 Log saved to {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockOpener, ScriptedPort};

    fn session_with(ports: &[ScriptedPort]) -> (DebugSession, Arc<MockOpener>) {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM0");
        for port in ports {
            opener.push_port(port.clone());
        }
        (DebugSession::new(FirmwareConfig::default(), opener.clone()), opener)
    }

    #[test]
    fn commands_encode_with_magic_and_ct_digit() {
        assert_eq!(DebugCommand::ResetReason.encode(), b"$I".to_vec());
        assert_eq!(DebugCommand::parse("ct-calibration", Some(2)).unwrap().encode(), b"$J2".to_vec());
        assert!(DebugCommand::parse("ct-calibration", Some(4)).is_err());
        assert!(DebugCommand::parse("ct-calibration", None).is_err());
        assert!(DebugCommand::parse("format-flash", None).is_err());
        for name in DebugCommand::NAMES {
            let ct = (name == "ct-calibration").then_some(1);
            assert!(DebugCommand::parse(name, ct).is_ok(), "{} should parse", name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_returns_the_device_answer() {
        let port = ScriptedPort::new();
        port.push_reply(b"recieved debug command\r\nESP_RST_POWERON\r\n".to_vec());
        let (session, _) = session_with(&[port.clone()]);

        let reply = session.send(DebugCommand::ResetReason).await.unwrap();
        assert!(reply.contains("ESP_RST_POWERON"));
        assert_eq!(port.writes(), vec![b"$I".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn log_request_retries_a_silent_device() {
        let silent = ScriptedPort::new();
        let talking = ScriptedPort::new();
        talking.push_reply(b"[12] boot ok\r\n[40] ct2 saturated\r\n".to_vec());
        let (session, opener) = session_with(&[silent.clone(), talking.clone()]);

        let log = session.fetch_logs().await.unwrap().unwrap();
        assert!(log.contains("ct2 saturated"));
        assert_eq!(opener.open_attempts(), 2);
        assert_eq!(silent.writes(), vec![b"$K".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_log_is_reported_as_none() {
        let port = ScriptedPort::new();
        port.push_reply(b"Logs are empty\r\n".to_vec());
        let (session, _) = session_with(&[port]);

        assert_eq!(session.fetch_logs().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_gives_up_after_all_attempts() {
        let (session, opener) = session_with(&[]);

        let err = session.fetch_logs().await.unwrap_err();
        assert!(matches!(err, WatcherError::LinkUnavailable(_)));
        assert_eq!(opener.open_attempts(), LOG_ATTEMPTS);
    }

    #[test]
    fn log_is_saved_under_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/module_m.log");
        save_log(&path, "line 1\nline 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line 1\nline 2\n");
    }
}
