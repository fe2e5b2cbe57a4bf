use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{FailureTracker, PollOutcome, TelemetryReader};
use crate::config::ModuleMConfig;
use crate::link::SerialLink;
use crate::storage::{Sample, SampleClock, SampleTime};
use crate::utils::error::{FrameDecodeError, WatcherResult};

pub const MAGIC: u8 = b'*';
pub const REGISTER_COMMAND: &[u8] = b"*A\n";

const SERIAL_FRAME_LEN: usize = 13;
const POWER_FRAME_LEN: usize = 41;
const ENERGY_FRAME_LEN: usize = 49;
const ERROR_HEADER_LEN: usize = 3;
/// An error report that has not completed within this many bytes is junk.
const MAX_PENDING_BYTES: usize = 1024;
const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerReading {
    pub export: [bool; 3],
    pub current_ma: [u32; 3],
    pub voltage_mv: [u32; 3],
    pub power_w: [u32; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleMFrame {
    Registered { serial: String },
    Power(PowerReading),
    Energy {
        power: PowerReading,
        forward_wh: u32,
        reverse_wh: u32,
    },
    Errors(Vec<String>),
}

/// Splits the Module-M byte stream into frames.
///
/// Anything before a `*` is garbage. Until the device confirms registration
/// with `*B`, every other frame is dropped.
#[derive(Debug, Default)]
pub struct ModuleMDecoder {
    buffer: BytesMut,
    registered: bool,
}

impl ModuleMDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.registered = false;
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<ModuleMFrame, FrameDecodeError>> {
        loop {
            match self.buffer.iter().position(|b| *b == MAGIC) {
                Some(start) => self.buffer.advance(start),
                None => {
                    self.buffer.clear();
                    return None;
                }
            }
            if self.buffer.len() < 2 {
                return None;
            }

            let command = self.buffer[1];
            if !self.registered && command != b'B' {
                self.buffer.advance(1);
                continue;
            }

            return match command {
                b'B' => self.take_serial(),
                b'C' => self.take_power(),
                b'D' => self.take_energy(),
                b'E' => self.take_errors(),
                other => {
                    self.buffer.advance(2);
                    Some(Err(FrameDecodeError::Malformed(format!(
                        "unknown command byte 0x{:02x}",
                        other
                    ))))
                }
            };
        }
    }

    fn take_serial(&mut self) -> Option<Result<ModuleMFrame, FrameDecodeError>> {
        if self.buffer.len() < SERIAL_FRAME_LEN {
            return None;
        }
        let frame = self.buffer.split_to(SERIAL_FRAME_LEN);
        let serial = String::from_utf8_lossy(&frame[2..])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        self.registered = true;
        Some(Ok(ModuleMFrame::Registered { serial }))
    }

    fn take_power(&mut self) -> Option<Result<ModuleMFrame, FrameDecodeError>> {
        if self.buffer.len() < POWER_FRAME_LEN {
            return None;
        }
        let frame = self.buffer.split_to(POWER_FRAME_LEN);
        let mut body = &frame[2..];
        Some(Ok(ModuleMFrame::Power(parse_power(&mut body))))
    }

    fn take_energy(&mut self) -> Option<Result<ModuleMFrame, FrameDecodeError>> {
        if self.buffer.len() < ENERGY_FRAME_LEN {
            return None;
        }
        let frame = self.buffer.split_to(ENERGY_FRAME_LEN);
        let mut body = &frame[2..];
        let power = parse_power(&mut body);
        Some(Ok(ModuleMFrame::Energy {
            power,
            forward_wh: body.get_u32_le(),
            reverse_wh: body.get_u32_le(),
        }))
    }

    fn take_errors(&mut self) -> Option<Result<ModuleMFrame, FrameDecodeError>> {
        if self.buffer.len() < ERROR_HEADER_LEN {
            return None;
        }
        let count = self.buffer[2] as usize;
        if count == 0 {
            self.buffer.advance(ERROR_HEADER_LEN);
            return Some(Ok(ModuleMFrame::Errors(Vec::new())));
        }

        let mut lines = Vec::with_capacity(count);
        let mut cursor = ERROR_HEADER_LEN;
        while lines.len() < count {
            let rest = &self.buffer[cursor..];
            match rest.windows(2).position(|w| w == b"\r\n") {
                Some(end) => {
                    lines.push(String::from_utf8_lossy(&rest[..end]).to_string());
                    cursor += end + 2;
                }
                None => {
                    if self.buffer.len() > MAX_PENDING_BYTES {
                        self.buffer.advance(2);
                        return Some(Err(FrameDecodeError::Truncated {
                            expected: count,
                            actual: lines.len(),
                        }));
                    }
                    return None;
                }
            }
        }

        self.buffer.advance(cursor);
        Some(Ok(ModuleMFrame::Errors(lines)))
    }
}

/// Export flags are C bools: any non-zero byte means export.
fn parse_power(body: &mut &[u8]) -> PowerReading {
    let mut export = [false; 3];
    for flag in export.iter_mut() {
        *flag = body.get_u8() != 0;
    }
    let mut triple = || [body.get_u32_le(), body.get_u32_le(), body.get_u32_le()];
    let current_ma = triple();
    let voltage_mv = triple();
    let power_w = triple();
    PowerReading {
        export,
        current_ma,
        voltage_mv,
        power_w,
    }
}

fn power_samples(source_id: &str, timestamp: SampleTime, reading: &PowerReading) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(12);
    for phase in 0..3 {
        let line = phase + 1;
        samples.push(Sample::new(
            source_id,
            timestamp,
            &format!("l{}_current", line),
            reading.current_ma[phase] as f64 / 1000.0,
            "A",
        ));
        samples.push(Sample::new(
            source_id,
            timestamp,
            &format!("l{}_voltage", line),
            reading.voltage_mv[phase] as f64 / 1000.0,
            "V",
        ));
        samples.push(Sample::new(
            source_id,
            timestamp,
            &format!("l{}_power", line),
            reading.power_w[phase] as f64,
            "W",
        ));
    }
    for (ct, export) in reading.export.iter().enumerate() {
        samples.push(Sample::new(
            source_id,
            timestamp,
            &format!("ct{}_export", ct + 1),
            if *export { 1.0 } else { 0.0 },
            "",
        ));
    }
    samples
}

/// Reads Module-M frames off its USB serial link.
pub struct ModuleMReader {
    source_id: String,
    config: ModuleMConfig,
    decoder: ModuleMDecoder,
    failures: FailureTracker,
    last_register_request: Option<Instant>,
    serial_number: Option<String>,
    device_errors: Vec<String>,
}

impl ModuleMReader {
    pub fn new(source_id: &str, config: ModuleMConfig) -> Self {
        let failures = FailureTracker::new(config.failure_threshold);
        Self {
            source_id: source_id.to_string(),
            config,
            decoder: ModuleMDecoder::new(),
            failures,
            last_register_request: None,
            serial_number: None,
            device_errors: Vec::new(),
        }
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// Error lines from the most recent `*E` report.
    pub fn device_errors(&self) -> &[String] {
        &self.device_errors
    }

    fn register_due(&self) -> bool {
        let interval = Duration::from_millis(self.config.register_interval_ms);
        match self.last_register_request {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    fn handle_frame(&mut self, frame: ModuleMFrame, clock: &mut SampleClock, outcome: &mut PollOutcome) {
        match frame {
            ModuleMFrame::Registered { serial } => {
                info!("✅ Module-M registered (serial {})", serial);
                self.serial_number = Some(serial);
            }
            ModuleMFrame::Power(reading) => {
                let timestamp = clock.stamp(&self.source_id);
                outcome.samples.extend(power_samples(&self.source_id, timestamp, &reading));
            }
            ModuleMFrame::Energy {
                power,
                forward_wh,
                reverse_wh,
            } => {
                let timestamp = clock.stamp(&self.source_id);
                outcome.samples.extend(power_samples(&self.source_id, timestamp, &power));
                outcome.samples.push(Sample::new(
                    &self.source_id,
                    timestamp,
                    "energy_forward",
                    forward_wh as f64 / 1000.0,
                    "kWh",
                ));
                outcome.samples.push(Sample::new(
                    &self.source_id,
                    timestamp,
                    "energy_reverse",
                    reverse_wh as f64 / 1000.0,
                    "kWh",
                ));
            }
            ModuleMFrame::Errors(lines) => {
                if lines.is_empty() {
                    debug!("Module-M reports no errors");
                }
                for line in &lines {
                    warn!("⚠️  Module-M error: {}", line);
                }
                self.device_errors = lines;
            }
        }
    }
}

#[async_trait]
impl TelemetryReader for ModuleMReader {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn device_type(&self) -> &str {
        "module_m"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive()
    }

    async fn on_connect(&mut self, _link: &mut SerialLink) -> WatcherResult<()> {
        self.decoder.reset();
        self.last_register_request = None;
        self.failures.success();
        Ok(())
    }

    async fn acquire(&mut self, link: &mut SerialLink, clock: &mut SampleClock) -> WatcherResult<PollOutcome> {
        let mut outcome = PollOutcome::default();

        if !self.decoder.is_registered() && self.register_due() {
            info!("📡 Registering with Module-M, sending *A");
            link.write(REGISTER_COMMAND)?;
            self.last_register_request = Some(Instant::now());
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = link.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.decoder.push(&chunk[..n]);
            if self.decoder.buffered() >= MAX_PENDING_BYTES {
                break;
            }
        }

        while let Some(result) = self.decoder.next_frame() {
            match result {
                Ok(frame) => {
                    self.failures.success();
                    self.handle_frame(frame, clock, &mut outcome);
                }
                Err(e) => {
                    warn!(
                        "⚠️  Discarding Module-M frame on '{}': {} ({} in a row)",
                        self.source_id,
                        e,
                        self.failures.consecutive() + 1
                    );
                    outcome.rejected.push(e);
                    if self.failures.failure() {
                        link.invalidate(&format!(
                            "{} consecutive bad Module-M frames",
                            self.failures.threshold()
                        ));
                        outcome.escalated = true;
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }
}
