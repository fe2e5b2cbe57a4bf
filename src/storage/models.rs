use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    Good,
    /// Decoded fine but the device flagged the value (e.g. exported phase).
    Suspect,
    /// Last known value repeated after the device went quiet.
    Stale,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::Good => "good",
            QualityFlag::Suspect => "suspect",
            QualityFlag::Stale => "stale",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(QualityFlag::Good),
            "suspect" => Ok(QualityFlag::Suspect),
            "stale" => Ok(QualityFlag::Stale),
            other => Err(format!("unknown quality flag '{}'", other)),
        }
    }
}

/// Monotonic milliseconds since the acquisition clock started, paired with
/// wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleTime {
    pub monotonic_ms: u64,
    pub wall_clock: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub source_id: String,
    pub timestamp: SampleTime,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub quality: QualityFlag,
}

impl Sample {
    pub fn new(
        source_id: &str,
        timestamp: SampleTime,
        metric_name: &str,
        value: f64,
        unit: &str,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            timestamp,
            metric_name: metric_name.to_string(),
            value,
            unit: unit.to_string(),
            quality: QualityFlag::Good,
        }
    }

    pub fn with_quality(mut self, quality: QualityFlag) -> Self {
        self.quality = quality;
        self
    }
}

/// Issues per-source timestamps that never go backwards within a session,
/// even if the wall clock is stepped by NTP.
#[derive(Debug)]
pub struct SampleClock {
    started: Instant,
    last: HashMap<String, SampleTime>,
}

impl SampleClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last: HashMap::new(),
        }
    }

    pub fn stamp(&mut self, source_id: &str) -> SampleTime {
        self.stamp_at(source_id, self.started.elapsed().as_millis() as u64, Utc::now())
    }

    pub fn stamp_at(&mut self, source_id: &str, monotonic_ms: u64, wall_clock: DateTime<Utc>) -> SampleTime {
        let stamp = match self.last.get(source_id) {
            Some(prev) => SampleTime {
                monotonic_ms: monotonic_ms.max(prev.monotonic_ms),
                wall_clock: wall_clock.max(prev.wall_clock),
            },
            None => SampleTime { monotonic_ms, wall_clock },
        };
        self.last.insert(source_id.to_string(), stamp);
        stamp
    }

    /// Starts a new connection session for `source_id`.
    pub fn reset_source(&mut self, source_id: &str) {
        self.last.remove(source_id);
    }
}

impl Default for SampleClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued sample with its buffer id. Ids are never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedSample {
    pub id: i64,
    pub sample: Sample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedBatch {
    pub sequence: u64,
    pub samples: Vec<BufferedSample>,
}

impl BufferedBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_id(&self) -> Option<i64> {
        self.samples.first().map(|s| s.id)
    }

    pub fn last_id(&self) -> Option<i64> {
        self.samples.last().map(|s| s.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub overflow_count: u64,
    pub next_batch_sequence: u64,
    pub in_flight_sequence: Option<u64>,
    pub oldest_wall_clock: Option<DateTime<Utc>>,
}

impl BufferStats {
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SampleRow {
    pub id: i64,
    pub source_id: String,
    pub monotonic_ms: i64,
    pub wall_clock_us: i64,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub quality: String,
}

impl SampleRow {
    pub fn into_buffered(self) -> BufferedSample {
        let wall_clock = Utc
            .timestamp_micros(self.wall_clock_us)
            .single()
            .unwrap_or_else(Utc::now);
        BufferedSample {
            id: self.id,
            sample: Sample {
                source_id: self.source_id,
                timestamp: SampleTime {
                    monotonic_ms: self.monotonic_ms.max(0) as u64,
                    wall_clock,
                },
                metric_name: self.metric_name,
                value: self.value,
                unit: self.unit,
                quality: self.quality.parse().unwrap_or(QualityFlag::Suspect),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn clock_never_goes_backwards_per_source() {
        let mut clock = SampleClock::new();
        let now = Utc::now();
        let a = clock.stamp_at("module_m", 1000, now);
        // wall clock stepped back by NTP, monotonic glitch
        let b = clock.stamp_at("module_m", 900, now - ChronoDuration::seconds(30));
        assert!(b.monotonic_ms >= a.monotonic_ms);
        assert!(b.wall_clock >= a.wall_clock);

        // other sources are independent
        let c = clock.stamp_at("energy_meter", 10, now - ChronoDuration::seconds(30));
        assert_eq!(c.monotonic_ms, 10);
    }

    #[test]
    fn reset_source_starts_new_session() {
        let mut clock = SampleClock::new();
        let now = Utc::now();
        clock.stamp_at("m", 5000, now);
        clock.reset_source("m");
        let fresh = clock.stamp_at("m", 10, now);
        assert_eq!(fresh.monotonic_ms, 10);
    }

    #[test]
    fn quality_round_trips_through_text() {
        for q in [QualityFlag::Good, QualityFlag::Suspect, QualityFlag::Stale] {
            assert_eq!(q.as_str().parse::<QualityFlag>().unwrap(), q);
        }
    }
}
