//! In-memory transports for tests and demos
//!
//! [`SimulatedRegisters`] and [`SimulatedJson`] stand in for a real unit.
//! Clones share state, so a test keeps one handle while the connection owns
//! another, then inspects what was written and when.
//!
//! Both simulators record an overlap when a second call arrives while one is
//! still in flight. On a real half-duplex line that would corrupt frames;
//! here it lets tests prove the connection lock serializes access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{HttpSettings, ModbusSettings};
use crate::constants::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::error::{ChargerError, ChargerResult};
use crate::registry::Connector;
use crate::transport::{RegisterKind, RegisterTransport, ValueTransport};

/// One register write observed by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub address: u16,
    pub values: Vec<u16>,
    pub at: Instant,
}

impl WriteRecord {
    /// Value written to `address` by this record, if it covers it.
    pub fn value_at(&self, address: u16) -> Option<u16> {
        address
            .checked_sub(self.address)
            .and_then(|offset| self.values.get(offset as usize).copied())
    }
}

#[derive(Default)]
struct RegisterState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    latency: Duration,
    fail_next: VecDeque<ChargerError>,
    failing_reads: HashMap<u16, ChargerError>,
    boundaries: Vec<u16>,
    truncate: Option<usize>,
    writes: Vec<WriteRecord>,
    reads: usize,
}

/// Shared in-memory register bank implementing [`RegisterTransport`].
///
/// Unset registers read as zero.
#[derive(Clone, Default)]
pub struct SimulatedRegisters {
    state: Arc<Mutex<RegisterState>>,
    busy: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
}

/// Marks the simulator busy for the duration of one call.
struct InFlight<'a> {
    busy: &'a AtomicBool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

fn enter<'a>(busy: &'a AtomicBool, overlapped: &AtomicBool) -> InFlight<'a> {
    if busy.swap(true, Ordering::SeqCst) {
        overlapped.store(true, Ordering::SeqCst);
    }
    InFlight { busy }
}

impl SimulatedRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegisterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut state = self.state();
        for (offset, &value) in values.iter().enumerate() {
            state.holding.insert(address.wrapping_add(offset as u16), value);
        }
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut state = self.state();
        for (offset, &value) in values.iter().enumerate() {
            state.input.insert(address.wrapping_add(offset as u16), value);
        }
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state().coils.insert(address, value);
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.state().holding.get(&address).copied().unwrap_or(0)
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state().coils.get(&address).copied().unwrap_or(false)
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Fail the next call of any kind with `err`.
    pub fn fail_next(&self, err: ChargerError) {
        self.state().fail_next.push_back(err);
    }

    /// Fail every read starting at `address` until cleared.
    pub fn fail_reads_at(&self, address: u16, err: ChargerError) {
        self.state().failing_reads.insert(address, err);
    }

    /// Reject reads that start before `address` and run past it, like
    /// units that only answer reads aligned to a value.
    pub fn fail_reads_across(&self, address: u16) {
        self.state().boundaries.push(address);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_next.clear();
        state.failing_reads.clear();
        state.boundaries.clear();
    }

    /// Return at most `count` registers from every read.
    pub fn truncate_reads(&self, count: usize) {
        self.state().truncate = Some(count);
    }

    /// All register writes in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Values written to `address`, in order.
    pub fn written_values(&self, address: u16) -> Vec<u16> {
        self.state()
            .writes
            .iter()
            .filter_map(|w| w.value_at(address))
            .collect()
    }

    /// Timestamps of writes covering `address`.
    pub fn write_times(&self, address: u16) -> Vec<Instant> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.value_at(address).is_some())
            .map(|w| w.at)
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    /// Whether two calls were ever in flight at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> ChargerResult<()> {
        let (latency, failure) = {
            let mut state = self.state();
            (state.latency, state.fail_next.pop_front())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_write(&self, address: u16, values: Vec<u16>) {
        let mut state = self.state();
        for (offset, &value) in values.iter().enumerate() {
            state.holding.insert(address.wrapping_add(offset as u16), value);
        }
        state.writes.push(WriteRecord {
            address,
            values,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl RegisterTransport for SimulatedRegisters {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> ChargerResult<Vec<u16>> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;

        if count > MAX_READ_REGISTERS {
            return Err(ChargerError::invalid_data(format!(
                "illegal data value: {} registers requested",
                count
            )));
        }

        let mut state = self.state();
        state.reads += 1;
        if let Some(err) = state.failing_reads.get(&address) {
            return Err(err.clone());
        }
        let end = u32::from(address) + u32::from(count);
        if let Some(boundary) = state
            .boundaries
            .iter()
            .find(|&&b| address < b && u32::from(b) < end)
        {
            return Err(ChargerError::invalid_data(format!(
                "illegal data address: read {}+{} crosses {}",
                address, count, boundary
            )));
        }

        let table = match kind {
            RegisterKind::Holding => &state.holding,
            RegisterKind::Input => &state.input,
        };
        let mut regs: Vec<u16> = (0..count)
            .map(|offset| {
                table
                    .get(&address.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();

        if let Some(limit) = state.truncate {
            regs.truncate(limit);
        }

        Ok(regs)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> ChargerResult<()> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;
        self.record_write(address, vec![value]);
        Ok(())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ChargerResult<()> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;
        if values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ChargerError::invalid_data(format!(
                "illegal data value: {} registers written",
                values.len()
            )));
        }
        self.record_write(address, values.to_vec());
        Ok(())
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> ChargerResult<Vec<bool>> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;

        let state = self.state();
        Ok((0..count)
            .map(|offset| {
                state
                    .coils
                    .get(&address.wrapping_add(offset))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> ChargerResult<()> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;
        self.state().coils.insert(address, value);
        Ok(())
    }
}

/// One document posted to a [`SimulatedJson`] unit.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub path: String,
    pub body: Value,
    pub at: Instant,
}

#[derive(Default)]
struct JsonState {
    documents: HashMap<String, Value>,
    posts: Vec<PostRecord>,
    latency: Duration,
    fail_next: VecDeque<ChargerError>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Value>>>,
}

/// Shared in-memory document store implementing [`ValueTransport`].
#[derive(Clone, Default)]
pub struct SimulatedJson {
    state: Arc<Mutex<JsonState>>,
    busy: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
}

impl SimulatedJson {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, JsonState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serve `document` for `GET path`.
    pub fn set(&self, path: &str, document: Value) {
        self.state().documents.insert(path.to_string(), document);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn fail_next(&self, err: ChargerError) {
        self.state().fail_next.push_back(err);
    }

    pub fn posts(&self) -> Vec<PostRecord> {
        self.state().posts.clone()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every open subscription on `topic`.
    pub fn publish(&self, topic: &str, event: Value) {
        let mut state = self.state();
        if let Some(subscribers) = state.subscribers.get_mut(topic) {
            subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    async fn begin(&self) -> ChargerResult<()> {
        let (latency, failure) = {
            let mut state = self.state();
            (state.latency, state.fail_next.pop_front())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ValueTransport for SimulatedJson {
    async fn get(&mut self, path: &str) -> ChargerResult<Value> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;

        self.state()
            .documents
            .get(path)
            .cloned()
            .ok_or_else(|| ChargerError::connection(format!("404 for {}", path)))
    }

    async fn post(&mut self, path: &str, body: Value) -> ChargerResult<()> {
        let _guard = enter(&self.busy, &self.overlapped);
        self.begin().await?;

        self.state().posts.push(PostRecord {
            path: path.to_string(),
            body,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> ChargerResult<mpsc::Receiver<Value>> {
        let (tx, rx) = mpsc::channel(16);
        self.state()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Default)]
struct ConnectorState {
    registers: HashMap<String, SimulatedRegisters>,
    documents: HashMap<String, SimulatedJson>,
    unit_ids: HashMap<String, u8>,
}

/// [`Connector`] handing out simulated units by charger name.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_registers(&self, name: &str, unit: SimulatedRegisters) {
        self.state().registers.insert(name.to_string(), unit);
    }

    pub fn add_json(&self, name: &str, unit: SimulatedJson) {
        self.state().documents.insert(name.to_string(), unit);
    }

    /// Unit id the last register link for `name` was opened with.
    pub fn unit_id(&self, name: &str) -> Option<u8> {
        self.state().unit_ids.get(name).copied()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn registers(
        &self,
        name: &str,
        _settings: &ModbusSettings,
        unit_id: u8,
    ) -> ChargerResult<Box<dyn RegisterTransport>> {
        let mut state = self.state();
        let unit = state
            .registers
            .get(name)
            .cloned()
            .ok_or_else(|| ChargerError::connection(format!("no simulated unit {}", name)))?;
        state.unit_ids.insert(name.to_string(), unit_id);
        Ok(Box::new(unit))
    }

    async fn values(
        &self,
        name: &str,
        _settings: &HttpSettings,
    ) -> ChargerResult<Box<dyn ValueTransport>> {
        let unit = self
            .state()
            .documents
            .get(name)
            .cloned()
            .ok_or_else(|| ChargerError::connection(format!("no simulated unit {}", name)))?;
        Ok(Box::new(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registers_default_to_zero() {
        let mut sim = SimulatedRegisters::new();
        sim.set_input(5, &[7]);
        let regs = sim.read_registers(RegisterKind::Input, 4, 3).await.unwrap();
        assert_eq!(regs, vec![0, 7, 0]);
        assert_eq!(sim.read_count(), 1);
    }

    #[tokio::test]
    async fn test_writes_are_recorded() {
        let mut sim = SimulatedRegisters::new();
        sim.write_registers(10, &[1, 2]).await.unwrap();
        sim.write_register(11, 9).await.unwrap();

        assert_eq!(sim.written_values(11), vec![2, 9]);
        assert_eq!(sim.holding(10), 1);
        assert_eq!(sim.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_reads_persist() {
        let mut sim = SimulatedRegisters::new();
        sim.fail_reads_at(1500, ChargerError::connection("illegal address"));

        assert!(sim.read_registers(RegisterKind::Holding, 1500, 2).await.is_err());
        assert!(sim.read_registers(RegisterKind::Holding, 1500, 2).await.is_err());
        sim.clear_failures();
        assert!(sim.read_registers(RegisterKind::Holding, 1500, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_requests_rejected() {
        let mut sim = SimulatedRegisters::new();
        let err = sim
            .read_registers(RegisterKind::Holding, 0, MAX_READ_REGISTERS + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ChargerError::InvalidData { .. }));
        assert_eq!(sim.read_count(), 0);

        let block = vec![0u16; MAX_WRITE_REGISTERS as usize + 1];
        assert!(sim.write_registers(0, &block).await.is_err());
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_reads_across_boundary_rejected() {
        let mut sim = SimulatedRegisters::new();
        sim.fail_reads_across(1010);

        assert!(sim.read_registers(RegisterKind::Holding, 1008, 2).await.is_ok());
        assert!(sim.read_registers(RegisterKind::Holding, 1010, 2).await.is_ok());
        assert!(sim.read_registers(RegisterKind::Holding, 1008, 6).await.is_err());
        assert!(sim.read_registers(RegisterKind::Input, 1009, 2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_detected() {
        let sim = SimulatedRegisters::new();
        sim.set_latency(Duration::from_millis(50));

        let mut a = sim.clone();
        let mut b = sim.clone();
        let (ra, rb) = tokio::join!(a.write_register(1, 1), b.write_register(2, 2));
        assert!(ra.is_ok() && rb.is_ok());
        assert!(sim.overlapped());
    }

    #[tokio::test]
    async fn test_json_subscribe_and_publish() {
        let mut sim = SimulatedJson::new();
        let mut rx = sim.subscribe("events").await.unwrap();
        sim.publish("events", json!({"plugged": true}));
        assert_eq!(rx.recv().await.unwrap(), json!({"plugged": true}));

        assert!(sim.get("/missing").await.is_err());
        sim.post("/set", json!({"ampere": 6})).await.unwrap();
        assert_eq!(sim.posts()[0].body, json!({"ampere": 6}));
    }
}
