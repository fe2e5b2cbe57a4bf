//! In-memory stand-ins for serial devices and sinks.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use crate::config::LinkConfig;
use crate::link::{PortOpener, SerialIo};
use crate::output::{Ack, TelemetrySink};
use crate::storage::BufferedBatch;
use crate::utils::error::{WatcherError, WatcherResult};

#[derive(Default)]
struct PortScript {
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    fail_reads: bool,
}

/// Serial port whose replies are queued up front. Each write releases the
/// next queued reply into the receive buffer.
#[derive(Clone, Default)]
pub struct ScriptedPort {
    script: Arc<Mutex<PortScript>>,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes readable right away.
    pub fn push_response(&self, bytes: Vec<u8>) {
        self.script.lock().unwrap().rx.extend(bytes);
    }

    /// Bytes readable after the next write.
    pub fn push_reply(&self, bytes: Vec<u8>) {
        self.script.lock().unwrap().replies.push_back(bytes);
    }

    pub fn fail_reads_with_io_error(&self) {
        self.script.lock().unwrap().fail_reads = true;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().writes.clone()
    }
}

impl SerialIo for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        if script.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let n = buf.len().min(script.rx.len());
        for (slot, byte) in buf.iter_mut().zip(script.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.writes.push(data.to_vec());
        if let Some(reply) = script.replies.pop_front() {
            script.rx.extend(reply);
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.script.lock().unwrap().rx.clear();
        Ok(())
    }
}

#[derive(Default)]
struct OpenerState {
    ports: VecDeque<ScriptedPort>,
    fail_next: u32,
    attempts: u32,
    discovered: Option<String>,
}

/// Hands out queued `ScriptedPort`s, one per successful open.
#[derive(Default)]
pub struct MockOpener {
    state: Mutex<OpenerState>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_port(&self, port: ScriptedPort) {
        self.state.lock().unwrap().ports.push_back(port);
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn set_discovered(&self, path: &str) {
        self.state.lock().unwrap().discovered = Some(path.to_string());
    }

    pub fn open_attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }
}

impl PortOpener for MockOpener {
    fn open(&self, path: &str, _config: &LinkConfig) -> WatcherResult<Box<dyn SerialIo>> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(WatcherError::LinkUnavailable(format!("{} busy", path)));
        }
        match state.ports.pop_front() {
            Some(port) => Ok(Box::new(port)),
            None => Err(WatcherError::LinkUnavailable(format!("{} not present", path))),
        }
    }

    fn find_by_usb_id(&self, _vid: u16, _pid: u16) -> Option<String> {
        self.state.lock().unwrap().discovered.clone()
    }
}

#[derive(Default)]
struct SinkState {
    stored: BTreeMap<u64, BufferedBatch>,
    deliveries: u32,
    down: bool,
    reject_auth: bool,
    drop_next_ack: bool,
}

/// Sink that keeps batches in memory, deduplicating by sequence.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    pub fn reject_auth(&self) {
        self.state.lock().unwrap().reject_auth = true;
    }

    /// Stores the next batch but reports a transport failure to the caller.
    pub fn lose_next_ack(&self) {
        self.state.lock().unwrap().drop_next_ack = true;
    }

    pub fn deliveries(&self) -> u32 {
        self.state.lock().unwrap().deliveries
    }

    pub fn stored_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .stored
            .values()
            .flat_map(|batch| batch.samples.iter().map(|s| s.id))
            .collect()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn insert_batch(&self, batch: &BufferedBatch) -> WatcherResult<Ack> {
        let mut state = self.state.lock().unwrap();
        state.deliveries += 1;
        if state.reject_auth {
            return Err(WatcherError::AuthError("HTTP 401".to_string()));
        }
        if state.down {
            return Err(WatcherError::SinkUnavailable("connection refused".to_string()));
        }

        let duplicate = state.stored.contains_key(&batch.sequence);
        if !duplicate {
            state.stored.insert(batch.sequence, batch.clone());
        }
        if state.drop_next_ack {
            state.drop_next_ack = false;
            return Err(WatcherError::SinkUnavailable("timed out waiting for response".to_string()));
        }
        Ok(Ack {
            sequence: batch.sequence,
            duplicate,
        })
    }

    fn sink_type(&self) -> &str {
        "memory"
    }

    fn destination(&self) -> &str {
        "memory"
    }
}
