use log::{error, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use super::job::{FirmwareJob, UpdateState};
use super::source::{sha256_hex, ImageSource};
use super::target::FirmwareTarget;
use super::uf2;
use crate::config::FirmwareConfig;
use crate::utils::error::{WatcherError, WatcherResult};

const VOLUME_POLL: Duration = Duration::from_millis(500);

/// Process exit status for a finished job.
pub fn exit_code(result: &WatcherResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(WatcherError::DownloadError(_)) => 2,
        Err(WatcherError::ChecksumMismatch { .. }) => 3,
        Err(WatcherError::BootloaderEntryTimeout(_)) => 4,
        Err(WatcherError::TransferError(_)) => 5,
        Err(WatcherError::VerificationTimeout(_)) => 6,
        Err(WatcherError::Cancelled) => 7,
        Err(_) => 1,
    }
}

/// Drives one [`FirmwareJob`] from download to a terminal state.
pub struct FirmwareUpdater {
    config: FirmwareConfig,
    source: Arc<dyn ImageSource>,
    target: Box<dyn FirmwareTarget>,
    cancel: watch::Receiver<bool>,
}

impl FirmwareUpdater {
    pub fn new(
        config: FirmwareConfig,
        source: Arc<dyn ImageSource>,
        target: Box<dyn FirmwareTarget>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            cancel,
        }
    }

    /// Runs `job` to completion, records it in the audit log and returns
    /// the outcome.
    pub async fn execute(&mut self, job: &mut FirmwareJob) -> WatcherResult<()> {
        let result = self.run(job).await;
        job.finish(&result);
        match &result {
            Ok(()) => info!("🎉 Firmware job {} finished", job.id),
            Err(e) => error!("❌ Firmware job {} failed: {}", job.id, e),
        }
        if let Err(e) = job.append_audit(&self.config.audit_log_path) {
            warn!("⚠️  Could not write firmware audit record: {}", e);
        }
        result
    }

    async fn run(&mut self, job: &mut FirmwareJob) -> WatcherResult<()> {
        job.enter(UpdateState::Downloading);
        let image_path = PathBuf::from(&self.config.download_path);
        self.download(job, &image_path).await?;
        let expected = match job.expected_checksum.clone() {
            Some(checksum) => checksum,
            None => self.published_checksum(job).await?,
        };

        job.enter(UpdateState::VerifyingChecksum);
        let image = tokio::fs::read(&image_path).await?;
        verify_image(&image, &expected)?;

        // Last point where the job may stop without touching the device
        if *self.cancel.borrow() {
            warn!("🛑 Firmware job {} cancelled before bootloader entry", job.id);
            return Err(WatcherError::Cancelled);
        }

        job.enter(UpdateState::EnteringBootloader);
        let volume = self.enter_bootloader(job).await?;

        job.enter(UpdateState::Transferring);
        job.bytes_transferred = self
            .target
            .write_image(&volume, &image_path)
            .await
            .map_err(|e| match e {
                WatcherError::TransferError(_) => e,
                other => WatcherError::TransferError(other.to_string()),
            })?;

        job.enter(UpdateState::VerifyingResult);
        self.verify_result().await?;
        job.version_after = self.target.read_version().await;
        Ok(())
    }

    async fn download(&self, job: &FirmwareJob, dest: &Path) -> WatcherResult<u64> {
        let source = self.source.clone();
        let url = job.source_url.clone();
        let dest = dest.to_path_buf();
        with_retry(&self.config, "download", move || {
            let source = source.clone();
            let url = url.clone();
            let dest = dest.clone();
            async move { source.fetch(&url, &dest).await }
        })
        .await
        .map_err(|e| match e {
            WatcherError::DownloadError(_) => e,
            other => WatcherError::DownloadError(other.to_string()),
        })
    }

    /// Checksum published next to the image. Without one there is nothing
    /// to trust the image against.
    async fn published_checksum(&self, job: &FirmwareJob) -> WatcherResult<String> {
        let source = self.source.clone();
        let url = job.source_url.clone();
        with_retry(&self.config, "checksum download", move || {
            let source = source.clone();
            let url = url.clone();
            async move { source.fetch_checksum(&url).await }
        })
        .await
        .map_err(|e| WatcherError::ChecksumMismatch {
            expected: format!("unavailable ({})", e),
            actual: "not compared".to_string(),
        })
    }

    async fn enter_bootloader(&mut self, job: &mut FirmwareJob) -> WatcherResult<String> {
        let wait = Duration::from_secs(self.config.bootloader_timeout_secs);

        if let Some(volume) = self.target.find_volume().await? {
            info!("💾 Module-M already in UF2 mode at {}", volume);
            return Ok(volume);
        }

        job.version_before = self.target.read_version().await;
        self.target.trigger_bootloader().await?;

        let target = &mut self.target;
        let found = timeout(wait, async {
            loop {
                match target.find_volume().await {
                    Ok(Some(volume)) => return volume,
                    Ok(None) => {}
                    Err(e) => warn!("⚠️  Volume lookup failed: {}", e),
                }
                sleep(VOLUME_POLL).await;
            }
        })
        .await;

        match found {
            Ok(volume) => {
                info!("💾 Bootloader volume {} appeared", volume);
                Ok(volume)
            }
            Err(_) => Err(WatcherError::BootloaderEntryTimeout(wait)),
        }
    }

    async fn verify_result(&mut self) -> WatcherResult<()> {
        let wait = Duration::from_secs(self.config.verify_timeout_secs);
        let target = &mut self.target;

        let back = timeout(wait, async {
            // A failed lookup says nothing about the volume being gone
            while target.find_volume().await?.is_some() {
                sleep(VOLUME_POLL).await;
            }
            info!("✅ Bootloader volume gone, waiting for the serial port");
            while !target.serial_present().await {
                sleep(VOLUME_POLL).await;
            }
            Ok::<(), WatcherError>(())
        })
        .await;

        back.map_err(|_| WatcherError::VerificationTimeout(wait))?
    }
}

/// Checks the image against `expected` and its UF2 structure. Either
/// failure means the image must not reach the device.
pub fn verify_image(image: &[u8], expected: &str) -> WatcherResult<()> {
    let actual = sha256_hex(image);
    let expected = expected.trim().to_lowercase();
    if actual != expected {
        return Err(WatcherError::ChecksumMismatch { expected, actual });
    }
    let summary = uf2::validate(image).map_err(|reason| WatcherError::ChecksumMismatch {
        expected: "well-formed UF2 image".to_string(),
        actual: reason,
    })?;
    info!(
        "✅ Checksum {} verified, {} UF2 blocks ({} payload bytes)",
        actual, summary.blocks, summary.payload_bytes
    );
    Ok(())
}

async fn with_retry<T, F, Fut>(config: &FirmwareConfig, what: &str, mut attempt: F) -> WatcherResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WatcherResult<T>>,
{
    let mut backoff = config.download.backoff();
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!("⚠️  {} failed ({}), retry {} in {:?}", what, e, backoff.failures(), delay);
                    sleep(delay).await;
                }
                None => {
                    error!("❌ {} failed after {} attempts: {}", what, backoff.failures(), e);
                    return Err(e);
                }
            },
        }
    }
}
