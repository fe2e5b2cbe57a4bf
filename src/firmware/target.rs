use async_trait::async_trait;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};

use crate::config::{FirmwareConfig, LinkConfig};
use crate::link::{PortOpener, SerialLink};
use crate::utils::backoff::RetryPolicy;
use crate::utils::error::{WatcherError, WatcherResult};

const BOOT_COMMAND: &[u8] = b"$D";
const VERSION_COMMAND: &[u8] = b"$K";
const BOOT_CONFIRMATION: &str = "Triggering bootloader";
// Spelling matches what the device prints
const VERSION_PREAMBLE: &str = "recieved debug command";
const VERSION_ATTEMPTS: u32 = 3;
const VERSION_SETTLE: Duration = Duration::from_millis(500);

/// The device being flashed: its serial side while running telemetry
/// firmware and its UF2 mass-storage side while in the bootloader.
#[async_trait]
pub trait FirmwareTarget: Send {
    /// Block device of the bootloader volume, if it is attached.
    async fn find_volume(&mut self) -> WatcherResult<Option<String>>;

    /// Asks the running firmware to reboot into its bootloader. Ok means
    /// the device confirmed or dropped off the bus.
    async fn trigger_bootloader(&mut self) -> WatcherResult<()>;

    /// Queries the firmware version. Informational only.
    async fn read_version(&mut self) -> Option<String>;

    /// Mounts `volume`, copies `image` onto it, syncs and unmounts.
    async fn write_image(&mut self, volume: &str, image: &Path) -> WatcherResult<u64>;

    /// True once the telemetry serial port is enumerated again.
    async fn serial_present(&mut self) -> bool;
}

/// DEVNAME of the block whose LABEL (or LABEL_FATBOOT) is `label` in
/// `blkid -o export` output.
pub fn parse_blkid(output: &str, label: &str) -> Option<String> {
    output.split("\n\n").find_map(|block| {
        let mut devname = None;
        let mut matched = false;
        for line in block.lines() {
            match line.trim().split_once('=') {
                Some(("DEVNAME", value)) => devname = Some(value.to_string()),
                Some(("LABEL", value)) | Some(("LABEL_FATBOOT", value)) if value == label => matched = true,
                _ => {}
            }
        }
        if matched {
            devname
        } else {
            None
        }
    })
}

/// Version line following the `$K` acknowledgement.
pub fn parse_version(reply: &str) -> Option<String> {
    let lines: Vec<&str> = reply.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let ack = lines.iter().position(|l| l.contains(VERSION_PREAMBLE))?;
    lines.get(ack + 1).map(|v| v.to_string())
}

/// Single-shot link to Module-M's command port, found by its USB id.
pub(crate) fn service_link(config: &FirmwareConfig, opener: Arc<dyn PortOpener>) -> SerialLink {
    let link = LinkConfig {
        name: "firmware".to_string(),
        device_path: None,
        usb_vid: Some(config.usb_vid),
        usb_pid: Some(config.usb_pid),
        baud_rate: config.baud_rate,
        reconnect: RetryPolicy::bounded(1, Duration::ZERO, Duration::ZERO),
        ..LinkConfig::default()
    };
    SerialLink::new(link, opener, None)
}

/// Module-M in the field: serial commands over CDC ACM and the
/// `ENERTYMBOOT` UF2 volume handled with blkid/mount/umount.
pub struct UsbUf2Target {
    config: FirmwareConfig,
    opener: Arc<dyn PortOpener>,
}

impl UsbUf2Target {
    pub fn new(config: FirmwareConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self { config, opener }
    }

    fn link(&self) -> SerialLink {
        service_link(&self.config, self.opener.clone())
    }

    /// Collects text from `link` until `done` matches or `timeout` passes.
    /// A read failure ends collection and is reported as `Err`.
    async fn collect(
        link: &mut SerialLink,
        timeout: Duration,
        done: impl Fn(&str) -> bool,
    ) -> Result<String, String> {
        let deadline = Instant::now() + timeout;
        let mut text = String::new();
        let mut buffer = [0u8; 256];
        while Instant::now() < deadline {
            match link.read(&mut buffer) {
                Ok(0) => sleep(Duration::from_millis(100)).await,
                Ok(n) => {
                    text.push_str(&String::from_utf8_lossy(&buffer[..n]));
                    if done(&text) {
                        break;
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(text)
    }

    async fn run(program: &str, args: &[&str]) -> WatcherResult<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(WatcherError::TransferError(format!(
                "{} {} failed ({}): {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn is_mounted(mount_point: &str) -> bool {
        match tokio::fs::read_to_string("/proc/mounts").await {
            Ok(mounts) => mounts
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(mount_point)),
            Err(_) => false,
        }
    }

    async fn unmount(mount_point: &str) -> WatcherResult<()> {
        if Self::is_mounted(mount_point).await {
            info!("💾 Unmounting {}", mount_point);
            Self::run("umount", &[mount_point]).await?;
        }
        Ok(())
    }

    async fn copy_to(mount_point: &str, image: &Path) -> WatcherResult<u64> {
        let name = image.file_name().unwrap_or_else(|| OsStr::new("firmware.uf2"));
        let dest: PathBuf = Path::new(mount_point).join(name);
        info!("📝 Copying {} to {}", image.display(), dest.display());
        let bytes = tokio::fs::copy(image, &dest).await?;
        let file = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
        file.sync_all().await?;
        Self::run("sync", &[]).await?;
        Ok(bytes)
    }
}

#[async_trait]
impl FirmwareTarget for UsbUf2Target {
    async fn find_volume(&mut self) -> WatcherResult<Option<String>> {
        // blkid exits non-zero when it finds nothing
        let output = Command::new("blkid").args(["-o", "export"]).output().await?;
        Ok(parse_blkid(&String::from_utf8_lossy(&output.stdout), &self.config.drive_label))
    }

    async fn trigger_bootloader(&mut self) -> WatcherResult<()> {
        let attempts = self.config.boot_command_retries.max(1);
        let timeout = Duration::from_millis(self.config.boot_command_timeout_ms);

        for attempt in 1..=attempts {
            let mut link = self.link();
            match link.open() {
                Ok(()) => {
                    info!("🔁 Attempt {}/{}: sending $D to Module-M", attempt, attempts);
                    let sent = link.clear_input().and_then(|_| link.write(BOOT_COMMAND));
                    match sent {
                        Ok(()) => match Self::collect(&mut link, timeout, |t| t.contains(BOOT_CONFIRMATION)).await {
                            Ok(reply) if reply.contains(BOOT_CONFIRMATION) => {
                                info!("✅ Bootloader trigger confirmed");
                                return Ok(());
                            }
                            Ok(reply) => warn!("⚠️  No bootloader confirmation, got {:?}", reply.trim()),
                            Err(reason) => {
                                info!("🔌 Serial link dropped ({}), bootloader trigger likely succeeded", reason);
                                return Ok(());
                            }
                        },
                        Err(e) => warn!("⚠️  Could not send $D: {}", e),
                    }
                    link.close();
                }
                Err(e) => warn!("⚠️  Attempt {}/{}: serial port unavailable: {}", attempt, attempts, e),
            }

            if attempt < attempts {
                sleep(Duration::from_millis(self.config.boot_command_retry_delay_ms)).await;
            }
        }

        Err(WatcherError::BootloaderEntryTimeout(timeout * attempts))
    }

    async fn read_version(&mut self) -> Option<String> {
        let timeout = Duration::from_millis(self.config.boot_command_timeout_ms);
        for attempt in 1..=VERSION_ATTEMPTS {
            let mut link = self.link();
            if let Err(e) = link.open() {
                debug!("Version query attempt {}: {}", attempt, e);
            } else if link.clear_input().and_then(|_| link.write(VERSION_COMMAND)).is_ok() {
                sleep(VERSION_SETTLE).await;
                let reply = Self::collect(&mut link, timeout, |t| parse_version(t).is_some())
                    .await
                    .unwrap_or_default();
                link.close();
                if let Some(version) = parse_version(&reply) {
                    info!("🏷️  Firmware version: {}", version);
                    return Some(version);
                }
                debug!("Version query attempt {} got {:?}", attempt, reply.trim());
            }
            if attempt < VERSION_ATTEMPTS {
                sleep(Duration::from_millis(self.config.boot_command_retry_delay_ms)).await;
            }
        }
        warn!("⚠️  Could not read firmware version");
        None
    }

    async fn write_image(&mut self, volume: &str, image: &Path) -> WatcherResult<u64> {
        let mount_point = self.config.mount_base.clone();
        Self::unmount(&mount_point).await?;
        tokio::fs::create_dir_all(&mount_point).await?;

        info!("💾 Mounting {} at {}", volume, mount_point);
        Self::run("mount", &["-o", "uid=0,gid=0,umask=0000", volume, &mount_point]).await?;

        let copied = Self::copy_to(&mount_point, image).await;
        // The bootloader may already have detached the volume
        let unmounted = Self::unmount(&mount_point).await;

        let bytes = copied?;
        if let Err(e) = unmounted {
            warn!("⚠️  {}", e);
        }
        info!("✅ {} bytes written to {}", bytes, volume);
        Ok(bytes)
    }

    async fn serial_present(&mut self) -> bool {
        self.opener
            .find_by_usb_id(self.config.usb_vid, self.config.usb_pid)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockOpener, ScriptedPort};

    const BLKID: &str = "DEVNAME=/dev/mmcblk0p1\nLABEL_FATBOOT=bootfs\nLABEL=bootfs\nTYPE=vfat\n\n\
DEVNAME=/dev/sda1\nSEC_TYPE=msdos\nLABEL_FATBOOT=ENERTYMBOOT\nLABEL=ENERTYMBOOT\nTYPE=vfat\n";

    fn config() -> FirmwareConfig {
        FirmwareConfig {
            boot_command_retries: 2,
            boot_command_timeout_ms: 300,
            boot_command_retry_delay_ms: 10,
            ..FirmwareConfig::default()
        }
    }

    #[test]
    fn finds_bootloader_volume_by_label() {
        assert_eq!(parse_blkid(BLKID, "ENERTYMBOOT"), Some("/dev/sda1".to_string()));
        assert_eq!(parse_blkid(BLKID, "OTHER"), None);
        assert_eq!(parse_blkid("", "ENERTYMBOOT"), None);
    }

    #[test]
    fn version_follows_acknowledgement() {
        assert_eq!(
            parse_version("noise\r\nrecieved debug command\r\nv2.4.1\r\n"),
            Some("v2.4.1".to_string())
        );
        assert_eq!(parse_version("recieved debug command\r\n"), None);
        assert_eq!(parse_version("v2.4.1\r\n"), None);
    }

    #[tokio::test]
    async fn bootloader_confirmed_on_reply() {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM0");
        let port = ScriptedPort::new();
        port.push_reply(b"Triggering bootloader...\r\n".to_vec());
        opener.push_port(port.clone());

        let mut target = UsbUf2Target::new(config(), opener);
        target.trigger_bootloader().await.unwrap();
        assert_eq!(port.writes(), vec![b"$D".to_vec()]);
    }

    #[tokio::test]
    async fn disconnect_counts_as_confirmation() {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM0");
        let port = ScriptedPort::new();
        port.fail_reads_with_io_error();
        opener.push_port(port);

        let mut target = UsbUf2Target::new(config(), opener);
        target.trigger_bootloader().await.unwrap();
    }

    #[tokio::test]
    async fn silent_device_exhausts_boot_attempts() {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM0");
        let first = ScriptedPort::new();
        let second = ScriptedPort::new();
        opener.push_port(first.clone());
        opener.push_port(second.clone());

        let mut target = UsbUf2Target::new(config(), opener.clone());
        let err = target.trigger_bootloader().await.unwrap_err();
        assert!(matches!(err, WatcherError::BootloaderEntryTimeout(_)));
        assert_eq!(opener.open_attempts(), 2);
        assert_eq!(first.writes().len() + second.writes().len(), 2);
    }

    #[tokio::test]
    async fn reads_version_over_serial() {
        let opener = Arc::new(MockOpener::new());
        opener.set_discovered("/dev/ttyACM0");
        let port = ScriptedPort::new();
        port.push_reply(b"recieved debug command\r\nv2.4.1\r\n".to_vec());
        opener.push_port(port);

        let mut target = UsbUf2Target::new(config(), opener);
        assert_eq!(target.read_version().await, Some("v2.4.1".to_string()));
        assert!(target.serial_present().await);
    }
}
