use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

use super::protocol::{Frame, ReadRequest, MAX_READ_QUANTITY};
use crate::config::{DataType, ModbusConfig, RegisterConfig};
use crate::devices::traits::{FailureTracker, PollOutcome, TelemetryReader};
use crate::link::SerialLink;
use crate::storage::{QualityFlag, Sample, SampleClock, SampleTime};
use crate::utils::error::WatcherResult;

/// Adjacent registers fetched with a single read request.
#[derive(Debug, Clone)]
struct RegisterSpan {
    request: ReadRequest,
    registers: Vec<RegisterConfig>,
}

impl RegisterSpan {
    fn decode(&self, words: &[u16], source_id: &str, timestamp: &SampleTime) -> Vec<Sample> {
        self.registers
            .iter()
            .filter_map(|register| {
                let offset = (register.address - self.request.start) as usize;
                let raw = words.get(offset..offset + register.data_type.word_count() as usize)?;
                let value = register_value(register.data_type, raw) * register.scale;
                let quality = if value.is_finite() {
                    QualityFlag::Good
                } else {
                    QualityFlag::Suspect
                };
                Some(
                    Sample::new(source_id, *timestamp, &register.name, value, &register.unit)
                        .with_quality(quality),
                )
            })
            .collect()
    }
}

/// Big-endian word order, as the meter sends 32-bit values.
pub fn register_value(data_type: DataType, words: &[u16]) -> f64 {
    let wide = || ((words[0] as u32) << 16) | words[1] as u32;
    match data_type {
        DataType::U16 => words[0] as f64,
        DataType::I16 => words[0] as i16 as f64,
        DataType::U32 => wide() as f64,
        DataType::I32 => wide() as i32 as f64,
        DataType::F32 => f32::from_bits(wide()) as f64,
    }
}

/// Sorts the register map and merges registers that sit next to each other.
fn group_spans(config: &ModbusConfig) -> Vec<RegisterSpan> {
    let mut registers = config.registers.clone();
    registers.sort_by_key(|r| r.address);

    let function = config.register_kind.function_code();
    let mut spans: Vec<RegisterSpan> = Vec::new();

    for register in registers {
        let words = register.data_type.word_count();
        if let Some(span) = spans.last_mut() {
            let end = u32::from(span.request.start) + u32::from(span.request.quantity);
            if u32::from(register.address) == end && span.request.quantity + words <= MAX_READ_QUANTITY {
                span.request.quantity += words;
                span.registers.push(register);
                continue;
            }
        }
        spans.push(RegisterSpan {
            request: ReadRequest {
                address: config.slave_address,
                function,
                start: register.address,
                quantity: words,
            },
            registers: vec![register],
        });
    }

    spans
}

/// Polls a Modbus RTU energy meter.
pub struct ModbusReader {
    source_id: String,
    config: ModbusConfig,
    spans: Vec<RegisterSpan>,
    failures: FailureTracker,
}

impl ModbusReader {
    pub fn new(source_id: &str, config: ModbusConfig) -> Self {
        let spans = group_spans(&config);
        let failures = FailureTracker::new(config.failure_threshold);
        Self {
            source_id: source_id.to_string(),
            config,
            spans,
            failures,
        }
    }

    pub fn request_count(&self) -> usize {
        self.spans.len()
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.config.response_timeout_ms)
    }
}

#[async_trait]
impl TelemetryReader for ModbusReader {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn device_type(&self) -> &str {
        "modbus_meter"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive()
    }

    async fn acquire(&mut self, link: &mut SerialLink, clock: &mut SampleClock) -> WatcherResult<PollOutcome> {
        let mut outcome = PollOutcome::default();
        let timeout = self.response_timeout();

        for span in &self.spans {
            let request = span.request;
            debug!(
                "📊 Reading {} registers from device {} starting at address {}",
                request.quantity, request.address, request.start
            );

            link.clear_input()?;
            link.write(&request.encode())?;
            let bytes = link.read_frame(request.expected_response_len(), timeout).await?;
            let timestamp = clock.stamp(&self.source_id);

            let mut frame = Frame::new(bytes);
            match request.decode_response(&mut frame) {
                Ok(words) => {
                    self.failures.success();
                    outcome.samples.extend(span.decode(&words, &self.source_id, &timestamp));
                }
                Err(e) => {
                    warn!(
                        "⚠️  Discarding frame from '{}' at 0x{:04x}: {} ({} in a row)",
                        self.source_id,
                        request.start,
                        e,
                        self.failures.consecutive() + 1
                    );
                    outcome.rejected.push(e);
                    if self.failures.failure() {
                        link.invalidate(&format!(
                            "{} consecutive bad frames from slave {}",
                            self.failures.threshold(),
                            request.address
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, RegisterKind};
    use crate::modbus::protocol::encode_read_response;
    use crate::testing::{MockOpener, ScriptedPort};
    use std::sync::Arc;

    fn register(name: &str, address: u16, data_type: DataType) -> RegisterConfig {
        RegisterConfig {
            name: name.to_string(),
            address,
            data_type,
            scale: 1.0,
            unit: "V".to_string(),
        }
    }

    fn meter_config() -> ModbusConfig {
        ModbusConfig {
            slave_address: 1,
            register_kind: RegisterKind::Input,
            poll_interval_ms: 1000,
            response_timeout_ms: 100,
            failure_threshold: 3,
            registers: vec![register("l1_voltage", 0, DataType::F32)],
        }
    }

    fn connected_link(port: ScriptedPort) -> SerialLink {
        let opener = Arc::new(MockOpener::new());
        opener.push_port(port);
        let config = LinkConfig {
            name: "meter".to_string(),
            device_path: Some("/dev/ttyUSB0".to_string()),
            ..LinkConfig::default()
        };
        let mut link = SerialLink::new(config, opener, None);
        link.open().unwrap();
        link
    }

    fn voltage_words(value: f32) -> [u16; 2] {
        let bits = value.to_bits();
        [(bits >> 16) as u16, bits as u16]
    }

    #[test]
    fn groups_adjacent_registers() {
        let reader = ModbusReader::new("meter", ModbusConfig::default());
        // Phase block 0x00..0x11 and the frequency/energy block at 0x46
        assert_eq!(reader.request_count(), 2);
        assert_eq!(reader.spans[0].request.quantity, 18);
        assert_eq!(reader.spans[1].request.start, 0x46);
        assert_eq!(reader.spans[1].request.quantity, 6);
    }

    #[test]
    fn grouping_handles_the_top_of_the_address_space() {
        let config = ModbusConfig {
            registers: vec![
                register("status", 0xFFFE, DataType::U16),
                register("flags", 0xFFFF, DataType::U16),
                register("l1_voltage", 0, DataType::F32),
            ],
            ..meter_config()
        };
        let reader = ModbusReader::new("meter", config);
        assert_eq!(reader.request_count(), 2);
        assert_eq!(reader.spans[1].request.start, 0xFFFE);
        assert_eq!(reader.spans[1].request.quantity, 2);
    }

    #[test]
    fn decodes_register_types() {
        assert_eq!(register_value(DataType::I16, &[0xFFFF]), -1.0);
        assert_eq!(register_value(DataType::U32, &[0x0001, 0x0000]), 65536.0);
        assert_eq!(register_value(DataType::I32, &[0xFFFF, 0xFFFE]), -2.0);
        assert_eq!(register_value(DataType::F32, &voltage_words(230.5)), 230.5);
    }

    #[tokio::test(start_paused = true)]
    async fn good_poll_produces_samples() {
        let port = ScriptedPort::new();
        let words = voltage_words(231.0);
        port.push_reply(encode_read_response(1, 0x04, &words));
        let mut link = connected_link(port.clone());

        let mut reader = ModbusReader::new("meter", meter_config());
        let mut clock = SampleClock::new();
        let outcome = reader.acquire(&mut link, &mut clock).await.unwrap();

        assert_eq!(port.writes(), vec![vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x02, 0x71, 0xCB]]);
        assert_eq!(outcome.samples.len(), 1);
        assert_eq!(outcome.samples[0].metric_name, "l1_voltage");
        assert_eq!(outcome.samples[0].value, 231.0);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_bad_frames_invalidate_link() {
        let port = ScriptedPort::new();
        for _ in 0..3 {
            let mut bad = encode_read_response(1, 0x04, &[1, 2]);
            bad[3] ^= 0x55;
            port.push_reply(bad);
        }
        let mut link = connected_link(port);
        let mut reader = ModbusReader::new("meter", meter_config());
        let mut clock = SampleClock::new();

        for expected in 1..3 {
            let outcome = reader.acquire(&mut link, &mut clock).await.unwrap();
            assert_eq!(outcome.rejected.len(), 1);
            assert!(!outcome.escalated);
            assert_eq!(reader.consecutive_failures(), expected);
        }

        let outcome = reader.acquire(&mut link, &mut clock).await.unwrap();
        assert!(outcome.escalated);
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_counts_as_failure() {
        let mut link = connected_link(ScriptedPort::new());
        let mut reader = ModbusReader::new("meter", meter_config());
        let mut clock = SampleClock::new();
        let outcome = reader.acquire(&mut link, &mut clock).await.unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(reader.consecutive_failures(), 1);
    }
}
