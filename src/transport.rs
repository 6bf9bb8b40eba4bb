//! Transport boundary and per-unit connection handle
//!
//! Transports are external collaborators: a Modbus master, an HTTP client,
//! an MQTT or WebSocket session. The core consumes them through two traits:
//!
//! | Trait | Operations |
//! |-------|------------|
//! | [`RegisterTransport`] | holding/input register reads, FC06/FC16 writes, coils |
//! | [`ValueTransport`] | JSON `get`, `post`, `subscribe` |
//!
//! A [`Connection`] exclusively owns one transport. Every logical operation
//! against the unit, foreground or heartbeat, runs inside a [`Transaction`],
//! which holds the connection lock for its whole lifetime. A read-then-write
//! sequence therefore never interleaves with another caller's bytes on a
//! half-duplex RS-485 line or a single-flight TCP slave.
//!
//! Each transport call is bounded by the connection timeout. The core does
//! not retry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::trace;

use crate::current::SetpointState;
use crate::error::{ChargerError, ChargerResult};

/// Modbus data table addressed by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// FC03 holding registers.
    Holding,
    /// FC04 input registers.
    Input,
}

/// Register-oriented request/response channel to one physical unit.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Read `count` registers (FC03/FC04).
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> ChargerResult<Vec<u16>>;

    /// Write a single register (FC06).
    async fn write_register(&mut self, address: u16, value: u16) -> ChargerResult<()>;

    /// Write a block of registers (FC16).
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ChargerResult<()>;

    /// Read `count` coils (FC01).
    async fn read_coils(&mut self, address: u16, count: u16) -> ChargerResult<Vec<bool>>;

    /// Write a single coil (FC05).
    async fn write_coil(&mut self, address: u16, value: bool) -> ChargerResult<()>;
}

#[async_trait]
impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> ChargerResult<Vec<u16>> {
        (**self).read_registers(kind, address, count).await
    }

    async fn write_register(&mut self, address: u16, value: u16) -> ChargerResult<()> {
        (**self).write_register(address, value).await
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ChargerResult<()> {
        (**self).write_registers(address, values).await
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> ChargerResult<Vec<bool>> {
        (**self).read_coils(address, count).await
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> ChargerResult<()> {
        (**self).write_coil(address, value).await
    }
}

/// Value-oriented channel (HTTP, MQTT, WebSocket) to one physical unit.
///
/// Reconnects, backoff and authentication handshakes belong to the
/// implementation; credential failures surface as
/// [`ChargerError::AuthenticationFailed`].
#[async_trait]
pub trait ValueTransport: Send {
    /// Fetch the JSON document at `path`.
    async fn get(&mut self, path: &str) -> ChargerResult<Value>;

    /// Send `body` to `path`.
    async fn post(&mut self, path: &str, body: Value) -> ChargerResult<()>;

    /// Stream of events published on `topic`.
    async fn subscribe(&mut self, topic: &str) -> ChargerResult<mpsc::Receiver<Value>> {
        Err(ChargerError::configuration(format!(
            "transport does not support subscriptions (topic {})",
            topic
        )))
    }
}

#[async_trait]
impl<T: ValueTransport + ?Sized> ValueTransport for Box<T> {
    async fn get(&mut self, path: &str) -> ChargerResult<Value> {
        (**self).get(path).await
    }

    async fn post(&mut self, path: &str, body: Value) -> ChargerResult<()> {
        (**self).post(path, body).await
    }

    async fn subscribe(&mut self, topic: &str) -> ChargerResult<mpsc::Receiver<Value>> {
        (**self).subscribe(topic).await
    }
}

/// Counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl ConnectionStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

struct Link<T> {
    transport: T,
    setpoint: SetpointState,
}

/// Exclusive handle on the connection to one physical unit.
///
/// Cloning shares the same underlying lock; clones are handed to the
/// facets and the heartbeat of the same charge point only.
pub struct Connection<T> {
    name: Arc<str>,
    link: Arc<Mutex<Link<T>>>,
    timeout: Duration,
    stats: Arc<ConnectionStats>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            link: Arc::clone(&self.link),
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> Connection<T> {
    pub fn new(name: &str, transport: T, timeout: Duration) -> Self {
        Self {
            name: Arc::from(name),
            link: Arc::new(Mutex::new(Link {
                transport,
                setpoint: SetpointState::default(),
            })),
            timeout,
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Acquire the connection for one logical operation.
    pub async fn transaction(&self) -> Transaction<'_, T> {
        Transaction {
            name: &self.name,
            link: self.link.lock().await,
            timeout: self.timeout,
            stats: &self.stats,
        }
    }
}

/// One logical operation against a unit; holds the connection lock.
pub struct Transaction<'a, T> {
    name: &'a str,
    link: MutexGuard<'a, Link<T>>,
    timeout: Duration,
    stats: &'a ConnectionStats,
}

async fn bounded<R, F>(
    stats: &ConnectionStats,
    timeout: Duration,
    operation: &str,
    fut: F,
) -> ChargerResult<R>
where
    F: Future<Output = ChargerResult<R>>,
{
    stats.requests.fetch_add(1, Ordering::Relaxed);

    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            Err(err)
        }
        Err(_) => {
            stats.timeouts.fetch_add(1, Ordering::Relaxed);
            Err(ChargerError::timeout(operation, timeout.as_millis() as u64))
        }
    }
}

impl<'a, T> Transaction<'a, T> {
    /// Last accepted setpoint of this unit.
    pub fn setpoint(&self) -> SetpointState {
        self.link.setpoint
    }

    pub(crate) fn set_setpoint(&mut self, state: SetpointState) {
        self.link.setpoint = state;
    }
}

impl<'a, T: RegisterTransport> Transaction<'a, T> {
    pub async fn read(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> ChargerResult<Vec<u16>> {
        trace!(unit = %self.name, ?kind, address, count, "read registers");
        let fut = self.link.transport.read_registers(kind, address, count);
        let regs = bounded(self.stats, self.timeout, "read registers", fut).await?;

        if regs.len() < count as usize {
            return Err(ChargerError::invalid_data(format!(
                "short read at {}: expected {} registers, got {}",
                address,
                count,
                regs.len()
            )));
        }

        Ok(regs)
    }

    pub async fn read_holding(&mut self, address: u16, count: u16) -> ChargerResult<Vec<u16>> {
        self.read(RegisterKind::Holding, address, count).await
    }

    pub async fn read_input(&mut self, address: u16, count: u16) -> ChargerResult<Vec<u16>> {
        self.read(RegisterKind::Input, address, count).await
    }

    pub async fn write_register(&mut self, address: u16, value: u16) -> ChargerResult<()> {
        trace!(unit = %self.name, address, value, "write register");
        let fut = self.link.transport.write_register(address, value);
        bounded(self.stats, self.timeout, "write register", fut).await
    }

    pub async fn write_registers(&mut self, address: u16, values: &[u16]) -> ChargerResult<()> {
        trace!(unit = %self.name, address, ?values, "write registers");
        let fut = self.link.transport.write_registers(address, values);
        bounded(self.stats, self.timeout, "write registers", fut).await
    }

    pub async fn read_coils(&mut self, address: u16, count: u16) -> ChargerResult<Vec<bool>> {
        let fut = self.link.transport.read_coils(address, count);
        bounded(self.stats, self.timeout, "read coils", fut).await
    }

    pub async fn write_coil(&mut self, address: u16, value: bool) -> ChargerResult<()> {
        trace!(unit = %self.name, address, value, "write coil");
        let fut = self.link.transport.write_coil(address, value);
        bounded(self.stats, self.timeout, "write coil", fut).await
    }
}

impl<'a, T: ValueTransport> Transaction<'a, T> {
    pub async fn get(&mut self, path: &str) -> ChargerResult<Value> {
        trace!(unit = %self.name, path, "get");
        let fut = self.link.transport.get(path);
        bounded(self.stats, self.timeout, "get", fut).await
    }

    pub async fn post(&mut self, path: &str, body: Value) -> ChargerResult<()> {
        trace!(unit = %self.name, path, %body, "post");
        let fut = self.link.transport.post(path, body);
        bounded(self.stats, self.timeout, "post", fut).await
    }

    pub async fn subscribe(&mut self, topic: &str) -> ChargerResult<mpsc::Receiver<Value>> {
        let fut = self.link.transport.subscribe(topic);
        bounded(self.stats, self.timeout, "subscribe", fut).await
    }
}
