use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::utils::error::{WatcherError, WatcherResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Downloading,
    VerifyingChecksum,
    EnteringBootloader,
    Transferring,
    VerifyingResult,
    Success,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Success | UpdateState::Failed)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Idle => "idle",
            UpdateState::Downloading => "downloading",
            UpdateState::VerifyingChecksum => "verifying_checksum",
            UpdateState::EnteringBootloader => "entering_bootloader",
            UpdateState::Transferring => "transferring",
            UpdateState::VerifyingResult => "verifying_result",
            UpdateState::Success => "success",
            UpdateState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: UpdateState,
    pub at: DateTime<Utc>,
}

/// One firmware update attempt. Serialized as the audit record once it
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareJob {
    pub id: Uuid,
    pub source_url: String,
    pub target_device_id: String,
    pub expected_checksum: Option<String>,
    pub state: UpdateState,
    pub history: Vec<Transition>,
    pub bytes_transferred: u64,
    pub version_before: Option<String>,
    pub version_after: Option<String>,
    pub error: Option<String>,
}

impl FirmwareJob {
    pub fn new(source_url: &str, target_device_id: &str, expected_checksum: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.to_string(),
            target_device_id: target_device_id.to_string(),
            expected_checksum: expected_checksum.map(|c| c.trim().to_lowercase()),
            state: UpdateState::Idle,
            history: vec![Transition {
                state: UpdateState::Idle,
                at: Utc::now(),
            }],
            bytes_transferred: 0,
            version_before: None,
            version_after: None,
            error: None,
        }
    }

    pub fn enter(&mut self, state: UpdateState) {
        if self.state.is_terminal() {
            warn!("⚠️  Job {} already {}, ignoring move to {}", self.id, self.state, state);
            return;
        }
        info!("🔧 Job {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.history.push(Transition { state, at: Utc::now() });
    }

    /// Marks the job terminal according to `result`.
    pub fn finish(&mut self, result: &WatcherResult<()>) {
        match result {
            Ok(()) => self.enter(UpdateState::Success),
            Err(e) => {
                self.error = Some(e.to_string());
                self.enter(UpdateState::Failed);
            }
        }
    }

    /// States visited, in order.
    pub fn visited(&self) -> Vec<UpdateState> {
        self.history.iter().map(|t| t.state).collect()
    }

    /// Appends this job as one JSON line to the audit log.
    pub fn append_audit<P: AsRef<Path>>(&self, path: P) -> WatcherResult<()> {
        let path = path.as_ref();
        if !self.state.is_terminal() {
            return Err(WatcherError::Config(format!(
                "job {} is still {}, not auditing",
                self.id, self.state
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Single status line printed when the job ends.
    pub fn summary_line(&self) -> String {
        let versions = format!(
            "{} -> {}",
            self.version_before.as_deref().unwrap_or("unknown"),
            self.version_after.as_deref().unwrap_or("unknown")
        );
        match self.state {
            UpdateState::Success => format!(
                "✅ Firmware job {} succeeded: {} bytes written, version {}",
                self.id, self.bytes_transferred, versions
            ),
            _ => format!(
                "❌ Firmware job {} {} after {}: {}",
                self.id,
                self.state,
                self.history
                    .iter()
                    .rev()
                    .map(|t| t.state)
                    .find(|s| !s.is_terminal())
                    .unwrap_or(UpdateState::Idle),
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_is_sticky() {
        let mut job = FirmwareJob::new("https://example.com/fw.uf2", "module_m", Some("ABC ".into()));
        assert_eq!(job.expected_checksum.as_deref(), Some("abc"));

        job.enter(UpdateState::Downloading);
        job.finish(&Err(WatcherError::DownloadError("404".into())));
        job.enter(UpdateState::Transferring);

        assert_eq!(job.state, UpdateState::Failed);
        assert_eq!(
            job.visited(),
            vec![UpdateState::Idle, UpdateState::Downloading, UpdateState::Failed]
        );
        assert!(job.summary_line().contains("after downloading"));
    }

    #[test]
    fn audit_appends_one_line_per_finished_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/firmware.jsonl");

        let mut job = FirmwareJob::new("https://example.com/fw.uf2", "module_m", None);
        assert!(job.append_audit(&path).is_err());

        job.enter(UpdateState::Downloading);
        job.finish(&Ok(()));
        job.append_audit(&path).unwrap();
        job.append_audit(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["state"], "success");
        assert_eq!(record["id"], job.id.to_string());
        assert_eq!(record["history"].as_array().unwrap().len(), 3);
    }
}
