use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{HttpSinkConfig, SinkConfig};
use crate::storage::BufferedBatch;
use crate::utils::error::{WatcherError, WatcherResult};

/// Confirmation that the sink holds every row of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub sequence: u64,
    /// The sink had already stored this batch.
    pub duplicate: bool,
}

/// One uploaded row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    pub batch_sequence: u64,
    pub sample_id: i64,
    pub watcher_id: String,
    pub source_id: String,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub quality: String,
    pub measured_at: DateTime<Utc>,
    pub monotonic_ms: u64,
}

pub fn batch_rows(watcher_id: &str, batch: &BufferedBatch) -> Vec<SinkRow> {
    batch
        .samples
        .iter()
        .map(|buffered| {
            let sample = &buffered.sample;
            SinkRow {
                batch_sequence: batch.sequence,
                sample_id: buffered.id,
                watcher_id: watcher_id.to_string(),
                source_id: sample.source_id.clone(),
                metric_name: sample.metric_name.clone(),
                value: sample.value,
                unit: sample.unit.clone(),
                quality: sample.quality.to_string(),
                measured_at: sample.timestamp.wall_clock,
                monotonic_ms: sample.timestamp.monotonic_ms,
            }
        })
        .collect()
}

/// Remote store for telemetry. Inserting the same batch sequence twice
/// must not store the rows twice.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn insert_batch(&self, batch: &BufferedBatch) -> WatcherResult<Ack>;
    fn sink_type(&self) -> &str;
    fn destination(&self) -> &str;
}

pub fn build_sink(config: &SinkConfig, watcher_id: &str) -> WatcherResult<Box<dyn TelemetrySink>> {
    match config {
        SinkConfig::Http(http) => Ok(Box::new(HttpSink::new(http, watcher_id)?)),
        SinkConfig::File(file) => Ok(Box::new(FileSink::new(&file.path, watcher_id))),
    }
}

/// PostgREST-style JSON endpoint.
pub struct HttpSink {
    endpoint: String,
    watcher_id: String,
    api_key: Option<String>,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(config: &HttpSinkConfig, watcher_id: &str) -> WatcherResult<Self> {
        if !config.endpoint.starts_with("https://") && !config.endpoint.starts_with("http://") {
            return Err(WatcherError::Config(format!(
                "Invalid sink endpoint '{}': must start with http:// or https://",
                config.endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| WatcherError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            watcher_id: watcher_id.to_string(),
            api_key: config.api_key.clone(),
            bearer_token: config.bearer_token.clone().or_else(|| config.api_key.clone()),
            client,
        })
    }

    fn idempotency_key(&self, sequence: u64) -> String {
        format!("{}-{}", self.watcher_id, sequence)
    }
}

/// Maps the sink's answer for batch `sequence` onto the delivery outcome.
pub fn classify_status(status: StatusCode, sequence: u64) -> WatcherResult<Ack> {
    if status.is_success() {
        return Ok(Ack {
            sequence,
            duplicate: false,
        });
    }
    match status {
        StatusCode::CONFLICT => Ok(Ack {
            sequence,
            duplicate: true,
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(WatcherError::AuthError(format!("HTTP {}", status)))
        }
        other => Err(WatcherError::SinkUnavailable(format!("HTTP {}", other))),
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn insert_batch(&self, batch: &BufferedBatch) -> WatcherResult<Ack> {
        let rows = batch_rows(&self.watcher_id, batch);
        debug!("📡 Posting batch {} ({} rows) to {}", batch.sequence, rows.len(), self.endpoint);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Prefer", "return=minimal")
            .header("Idempotency-Key", self.idempotency_key(batch.sequence))
            .header("X-Batch-Sequence", batch.sequence.to_string())
            .json(&rows);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WatcherError::SinkUnavailable(format!("{}: {}", self.endpoint, e)))?;

        let status = response.status();
        let result = classify_status(status, batch.sequence);
        match &result {
            Ok(ack) if ack.duplicate => {
                info!("♻️  Batch {} already stored by sink", batch.sequence)
            }
            Ok(_) => {}
            Err(WatcherError::AuthError(_)) => {
                let body = response.text().await.unwrap_or_default();
                error!("❌ Sink rejected credentials: HTTP {} {}", status, body);
            }
            Err(_) => {
                let body = response.text().await.unwrap_or_default();
                warn!("⚠️  Sink answered HTTP {} for batch {}: {}", status, batch.sequence, body);
            }
        }
        result
    }

    fn sink_type(&self) -> &str {
        "http"
    }

    fn destination(&self) -> &str {
        &self.endpoint
    }
}

/// Appends rows as JSON lines. Batches at or below the highest sequence
/// already in the file are acknowledged as duplicates.
pub struct FileSink {
    file_path: PathBuf,
    display_path: String,
    watcher_id: String,
    last_sequence: Mutex<Option<u64>>,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(file_path: P, watcher_id: &str) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            display_path: file_path.as_ref().to_string_lossy().to_string(),
            watcher_id: watcher_id.to_string(),
            last_sequence: Mutex::new(None),
        }
    }

    async fn stored_high_water(&self) -> WatcherResult<u64> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(WatcherError::SinkUnavailable(format!("{}: {}", self.display_path, e))),
        };

        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<SinkRow>(line).ok())
            .map(|row| row.batch_sequence)
            .max()
            .unwrap_or(0))
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    async fn insert_batch(&self, batch: &BufferedBatch) -> WatcherResult<Ack> {
        let mut last = self.last_sequence.lock().await;
        let high_water = match *last {
            Some(seq) => seq,
            None => self.stored_high_water().await?,
        };
        *last = Some(high_water);

        if batch.sequence <= high_water {
            info!("♻️  Batch {} already in {}", batch.sequence, self.display_path);
            return Ok(Ack {
                sequence: batch.sequence,
                duplicate: true,
            });
        }

        let mut content = String::new();
        for row in batch_rows(&self.watcher_id, batch) {
            content.push_str(&serde_json::to_string(&row)?);
            content.push('\n');
        }

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let write = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_data().await
        };
        write.await.map_err(|e| {
            error!("❌ Failed to write to file {}: {}", self.display_path, e);
            WatcherError::SinkUnavailable(format!("{}: {}", self.display_path, e))
        })?;

        *last = Some(batch.sequence);
        debug!("📝 Wrote batch {} ({} rows) to {}", batch.sequence, batch.len(), self.display_path);
        Ok(Ack {
            sequence: batch.sequence,
            duplicate: false,
        })
    }

    fn sink_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.display_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BufferedSample, Sample, SampleClock};

    fn batch(sequence: u64, ids: &[i64]) -> BufferedBatch {
        let mut clock = SampleClock::new();
        BufferedBatch {
            sequence,
            samples: ids
                .iter()
                .map(|id| BufferedSample {
                    id: *id,
                    sample: Sample::new("meter", clock.stamp("meter"), "frequency", 50.0, "Hz"),
                })
                .collect(),
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::CREATED, 4).unwrap(), Ack { sequence: 4, duplicate: false });
        assert!(classify_status(StatusCode::CONFLICT, 4).unwrap().duplicate);
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, 4), Err(WatcherError::AuthError(_))));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN, 4), Err(WatcherError::AuthError(_))));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, 4),
            Err(WatcherError::SinkUnavailable(_))
        ));
    }

    #[test]
    fn http_sink_rejects_bad_endpoint() {
        let config = HttpSinkConfig {
            endpoint: "ftp://example.org".to_string(),
            api_key: None,
            bearer_token: None,
            timeout_seconds: 5,
        };
        assert!(matches!(HttpSink::new(&config, "w1"), Err(WatcherError::Config(_))));
    }

    #[tokio::test]
    async fn file_sink_dedups_by_sequence_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/rows.jsonl");

        let sink = FileSink::new(&path, "w1");
        assert!(!sink.insert_batch(&batch(1, &[1, 2])).await.unwrap().duplicate);
        assert!(sink.insert_batch(&batch(1, &[1, 2])).await.unwrap().duplicate);
        assert!(!sink.insert_batch(&batch(2, &[3])).await.unwrap().duplicate);

        let reopened = FileSink::new(&path, "w1");
        assert!(reopened.insert_batch(&batch(2, &[3])).await.unwrap().duplicate);

        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<SinkRow> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.iter().map(|r| r.sample_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(rows[0].watcher_id, "w1");
    }
}
