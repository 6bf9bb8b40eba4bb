//! # Failsafe Heartbeat
//!
//! Charge points carry a hardware watchdog: absent a fresh command within
//! its timeout, the unit falls back to a vendor default (usually: stop
//! charging). The heartbeat keeps that watchdog fed by re-asserting the last
//! accepted setpoint on a fixed period.
//!
//! All heartbeats of a process run on one [`HeartbeatScheduler`] task.
//! Each charge point registers an entry with its own [`WatchdogPolicy`] and
//! gets back a [`HeartbeatHandle`]; dropping or cancelling the handle
//! removes the entry.
//!
//! ## Failure semantics
//!
//! | Event | Behavior |
//! |-------|----------|
//! | beat fails | logged with `error!`, cadence unchanged |
//! | failures span a full watchdog timeout | logged once with `warn!` |
//! | previous beat still running | tick skipped |
//! | scheduler cancelled | every entry stops, in-flight beats aborted |
//!
//! Errors never reach a foreground caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{HEARTBEAT_DIVISOR, MIN_HEARTBEAT_INTERVAL};
use crate::error::{ChargerError, ChargerResult};

/// Vendor watchdog timeout and the heartbeat period derived from it.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use voltage_evse::WatchdogPolicy;
///
/// let policy = WatchdogPolicy::from_timeout(Duration::from_secs(10)).unwrap();
/// assert_eq!(policy.interval(), Duration::from_secs(5));
///
/// assert!(WatchdogPolicy::new(Duration::from_secs(10), Duration::from_secs(6)).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    timeout: Duration,
    interval: Duration,
}

impl WatchdogPolicy {
    /// Policy beating at `timeout / 2`.
    pub fn from_timeout(timeout: Duration) -> ChargerResult<Self> {
        Self::new(timeout, timeout / HEARTBEAT_DIVISOR)
    }

    /// Policy with an explicit interval, which must not exceed `timeout / 2`.
    pub fn new(timeout: Duration, interval: Duration) -> ChargerResult<Self> {
        if interval < MIN_HEARTBEAT_INTERVAL {
            return Err(ChargerError::configuration(format!(
                "heartbeat interval {:?} below minimum {:?}",
                interval, MIN_HEARTBEAT_INTERVAL
            )));
        }

        if interval > timeout / HEARTBEAT_DIVISOR {
            return Err(ChargerError::configuration(format!(
                "heartbeat interval {:?} exceeds half the watchdog timeout {:?}",
                interval, timeout
            )));
        }

        Ok(Self { timeout, interval })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Work performed on every tick of one entry.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> ChargerResult<()>;
}

enum Command {
    Register {
        id: u64,
        name: Arc<str>,
        policy: WatchdogPolicy,
        beat: Arc<dyn Heartbeat>,
    },
    Remove {
        id: u64,
        ack: Option<oneshot::Sender<()>>,
    },
}

struct Entry {
    name: Arc<str>,
    policy: WatchdogPolicy,
    beat: Arc<dyn Heartbeat>,
    next: Instant,
    in_flight: Option<AbortHandle>,
    failures: u32,
    warned: bool,
}

impl Entry {
    fn busy(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn record(&mut self, result: ChargerResult<()>) {
        self.in_flight = None;

        match result {
            Ok(()) => {
                if self.failures > 0 {
                    info!(
                        charger = %self.name,
                        failures = self.failures,
                        "heartbeat recovered"
                    );
                }
                self.failures = 0;
                self.warned = false;
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                error!(
                    charger = %self.name,
                    error = %e,
                    consecutive_failures = self.failures,
                    "heartbeat failed"
                );

                let silent_for = self.policy.interval.saturating_mul(self.failures);
                if !self.warned && silent_for >= self.policy.timeout {
                    warn!(
                        charger = %self.name,
                        timeout_ms = self.policy.timeout.as_millis() as u64,
                        "heartbeat silent for a full watchdog timeout, unit will fall back to its failsafe"
                    );
                    self.warned = true;
                }
            }
        }
    }
}

/// Central periodic scheduler for all heartbeats.
///
/// Cloning shares the same scheduler task.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HeartbeatScheduler {
    /// Spawn a scheduler on the current tokio runtime.
    pub fn start() -> Self {
        Self::spawn(CancellationToken::new())
    }

    /// Spawn a scheduler that stops when `parent` is cancelled.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self::spawn(parent.child_token())
    }

    fn spawn(cancel: CancellationToken) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(run(rx, cancel.clone(), Arc::clone(&active)));

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            active,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Add an entry beating on `policy.interval()`, first beat one interval
    /// from now.
    pub fn register(
        &self,
        name: &str,
        policy: WatchdogPolicy,
        beat: Arc<dyn Heartbeat>,
    ) -> ChargerResult<HeartbeatHandle> {
        if self.cancel.is_cancelled() {
            return Err(ChargerError::configuration("heartbeat scheduler stopped"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Register {
                id,
                name: Arc::from(name),
                policy,
                beat,
            })
            .map_err(|_| ChargerError::configuration("heartbeat scheduler stopped"))?;

        Ok(HeartbeatHandle {
            id,
            policy,
            commands: self.commands.clone(),
            registered: true,
        })
    }

    /// Number of registered entries.
    pub fn active_entries(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop every entry and wait for the scheduler task to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "heartbeat scheduler task failed");
            }
        }
    }
}

/// Registration of one charge point with the scheduler.
///
/// Dropping the handle removes the entry.
pub struct HeartbeatHandle {
    id: u64,
    policy: WatchdogPolicy,
    commands: mpsc::UnboundedSender<Command>,
    registered: bool,
}

impl HeartbeatHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> WatchdogPolicy {
        self.policy
    }

    /// Remove the entry and wait until the scheduler has acknowledged it.
    /// No beat of this entry runs after this returns.
    pub async fn cancel(mut self) {
        self.registered = false;

        let (ack, done) = oneshot::channel();
        let removed = self.commands.send(Command::Remove {
            id: self.id,
            ack: Some(ack),
        });

        // A stopped scheduler runs nothing, so there is nothing to wait for.
        if removed.is_ok() {
            let _ = done.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if self.registered {
            let _ = self.commands.send(Command::Remove {
                id: self.id,
                ack: None,
            });
        }
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    let mut entries: HashMap<u64, Entry> = HashMap::new();
    let mut running: JoinSet<(u64, ChargerResult<()>)> = JoinSet::new();

    debug!("heartbeat scheduler started");

    loop {
        let next_due = entries.values().map(|e| e.next).min();
        let sleep = async move {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            command = commands.recv() => match command {
                Some(Command::Register { id, name, policy, beat }) => {
                    info!(
                        charger = %name,
                        interval_ms = policy.interval().as_millis() as u64,
                        timeout_ms = policy.timeout().as_millis() as u64,
                        "heartbeat registered"
                    );
                    entries.insert(id, Entry {
                        name,
                        policy,
                        beat,
                        next: Instant::now() + policy.interval(),
                        in_flight: None,
                        failures: 0,
                        warned: false,
                    });
                    active.store(entries.len(), Ordering::SeqCst);
                }
                Some(Command::Remove { id, ack }) => {
                    if let Some(entry) = entries.remove(&id) {
                        if let Some(handle) = entry.in_flight {
                            handle.abort();
                        }
                        debug!(charger = %entry.name, "heartbeat removed");
                    }
                    active.store(entries.len(), Ordering::SeqCst);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                None => break,
            },

            Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                Ok((id, result)) => {
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.record(result);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "heartbeat task panicked"),
            },

            _ = sleep => {
                let now = Instant::now();
                for (&id, entry) in entries.iter_mut() {
                    if entry.next > now {
                        continue;
                    }

                    while entry.next <= now {
                        entry.next += entry.policy.interval();
                    }

                    if entry.busy() {
                        trace!(charger = %entry.name, "previous beat still running, tick skipped");
                        continue;
                    }

                    let beat = Arc::clone(&entry.beat);
                    entry.in_flight = Some(running.spawn(async move { (id, beat.beat().await) }));
                }
            }
        }
    }

    running.abort_all();
    entries.clear();
    active.store(0, Ordering::SeqCst);

    debug!("heartbeat scheduler stopped");
}
