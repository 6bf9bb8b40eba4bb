//! # Current Control
//!
//! [`CurrentController`] is the single writer of a unit's current setpoint
//! and enabled flag. The vendor-specific half, how a demand is laid out on
//! the wire, is a [`SetpointSink`].
//!
//! ## Setpoint rules
//!
//! - A non-zero request below the vendor minimum (typically 6 A) is rejected
//!   with [`ChargerError::InvalidArgument`] before anything is written.
//! - The remembered target and enabled flag change only after the unit
//!   accepted the write. A failed write leaves the previous setpoint in force
//!   for the next heartbeat.
//! - Unit conversions round toward the lower value; over-reporting available
//!   current is the unsafe direction.
//!
//! The remembered state lives behind the connection lock, so a heartbeat
//! can never observe a write whose state update has not landed yet.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{DEFAULT_MAX_CURRENT, DEFAULT_MIN_CURRENT, DUTY_CYCLE_STEP, NOMINAL_VOLTAGE};
use crate::error::{ChargerError, ChargerResult};
use crate::transport::{Connection, Transaction};

/// Tolerance applied before flooring so that 2.3 A encodes as 23 deci-amps.
const ROUNDING_EPSILON: f64 = 1e-6;

/// Allowed current range of a unit.
///
/// # Example
///
/// ```rust
/// use voltage_evse::CurrentLimits;
///
/// let limits = CurrentLimits::new().with_min(6.0).with_max(16.0);
/// assert!(limits.validate(10.0).is_ok());
/// assert!(limits.validate(0.0).is_ok());
/// assert!(limits.validate(5.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLimits {
    /// Lowest non-zero current the unit accepts.
    pub min: f64,
    /// Highest current the unit accepts.
    pub max: f64,
}

impl Default for CurrentLimits {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_CURRENT,
            max: DEFAULT_MAX_CURRENT,
        }
    }
}

impl CurrentLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = max;
        self
    }

    /// Check a requested current. Zero is always valid and means "off".
    pub fn validate(&self, amps: f64) -> ChargerResult<()> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(ChargerError::invalid_argument(format!(
                "invalid current {}",
                amps
            )));
        }

        if amps > 0.0 && amps < self.min {
            return Err(ChargerError::invalid_argument(format!(
                "current {:.3}A below minimum {:.1}A",
                amps, self.min
            )));
        }

        if amps > self.max {
            return Err(ChargerError::invalid_argument(format!(
                "current {:.3}A above maximum {:.1}A",
                amps, self.max
            )));
        }

        Ok(())
    }
}

/// Vendor unit of the current register.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentEncoding {
    /// Whole amperes.
    Amps,
    /// Tenths of an ampere.
    DeciAmps,
    /// Milliamperes.
    MilliAmps,
    /// PWM duty cycle in 0.1% steps (0.06 A each).
    DutyCycle,
    /// Power in watts at the given phase voltage and active phase count.
    Watts { voltage: f64 },
}

impl CurrentEncoding {
    /// Power encoding at nominal 230 V.
    pub const fn nominal_watts() -> Self {
        Self::Watts {
            voltage: NOMINAL_VOLTAGE,
        }
    }

    /// Whether encoding needs the number of active phases.
    pub fn needs_phases(&self) -> bool {
        matches!(self, Self::Watts { .. })
    }

    fn scale(&self, phases: u8) -> f64 {
        match self {
            Self::Amps => 1.0,
            Self::DeciAmps => 10.0,
            Self::MilliAmps => 1000.0,
            Self::DutyCycle => 1.0 / DUTY_CYCLE_STEP,
            Self::Watts { voltage } => voltage * f64::from(phases.max(1)),
        }
    }

    /// Convert amperes to the raw register value, rounding down.
    pub fn encode(&self, amps: f64, phases: u8) -> ChargerResult<u32> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(ChargerError::invalid_argument(format!(
                "invalid current {}",
                amps
            )));
        }

        let raw = (amps * self.scale(phases) + ROUNDING_EPSILON).floor();
        if raw > f64::from(u32::MAX) {
            return Err(ChargerError::invalid_argument(format!(
                "current {}A out of range for {:?}",
                amps, self
            )));
        }

        Ok(raw as u32)
    }

    /// Convert a raw register value back to amperes.
    pub fn decode(&self, raw: u32, phases: u8) -> f64 {
        f64::from(raw) / self.scale(phases)
    }
}

/// What a sink must put on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Demand {
    /// Disable sentinel.
    Off,
    /// Offer this many amperes.
    Current(f64),
}

/// Last accepted setpoint of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SetpointState {
    /// Last accepted non-zero target, `None` until one was accepted.
    pub target: Option<f64>,
    /// Last accepted enabled flag.
    pub enabled: bool,
    /// Whether any setpoint has been accepted yet.
    pub asserted: bool,
}

impl SetpointState {
    /// The demand this state represents under `limits`.
    pub fn demand(&self, limits: &CurrentLimits) -> Demand {
        if self.enabled {
            Demand::Current(self.target.unwrap_or(limits.min))
        } else {
            Demand::Off
        }
    }
}

/// Vendor-specific wire layout of a current demand.
#[async_trait]
pub trait SetpointSink<T: Send>: Send + Sync {
    /// Write `demand` within the caller's transaction.
    async fn apply(&self, tx: &mut Transaction<'_, T>, demand: Demand) -> ChargerResult<()>;

    /// Derive the enabled flag from hardware, `None` if the unit cannot tell.
    async fn read_enabled(&self, _tx: &mut Transaction<'_, T>) -> ChargerResult<Option<bool>> {
        Ok(None)
    }
}

/// Single writer of one unit's current setpoint.
pub struct CurrentController<T, S> {
    conn: Connection<T>,
    sink: S,
    limits: CurrentLimits,
}

impl<T: Send, S: SetpointSink<T>> CurrentController<T, S> {
    pub fn new(conn: Connection<T>, sink: S, limits: CurrentLimits) -> Self {
        Self { conn, sink, limits }
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    pub fn limits(&self) -> &CurrentLimits {
        &self.limits
    }

    /// Switch the unit on at the remembered target, or off.
    pub async fn enable(&self, on: bool) -> ChargerResult<()> {
        let mut tx = self.conn.transaction().await;

        let mut state = tx.setpoint();
        state.enabled = on;
        let demand = state.demand(&self.limits);

        self.sink.apply(&mut tx, demand).await?;

        state.asserted = true;
        tx.set_setpoint(state);
        debug!(unit = %self.conn.name(), enabled = on, ?demand, "enable accepted");

        Ok(())
    }

    /// Set the offered current; zero switches the unit off.
    pub async fn set_max_current(&self, amps: f64) -> ChargerResult<()> {
        self.limits.validate(amps)?;

        let mut tx = self.conn.transaction().await;

        let mut state = tx.setpoint();
        if amps == 0.0 {
            state.enabled = false;
        } else {
            state.target = Some(amps);
        }
        let demand = state.demand(&self.limits);

        self.sink.apply(&mut tx, demand).await?;

        state.asserted = true;
        tx.set_setpoint(state);
        debug!(unit = %self.conn.name(), amps, ?demand, "max current accepted");

        Ok(())
    }

    /// Enabled flag, read back from hardware where the unit supports it.
    pub async fn read_enabled(&self) -> ChargerResult<bool> {
        let mut tx = self.conn.transaction().await;

        match self.sink.read_enabled(&mut tx).await? {
            Some(enabled) => Ok(enabled),
            None => Ok(tx.setpoint().enabled),
        }
    }

    /// Re-issue the last accepted setpoint. Returns `false` when nothing has
    /// been accepted yet and there is nothing to re-assert.
    pub async fn reassert(&self) -> ChargerResult<bool> {
        let mut tx = self.conn.transaction().await;

        let state = tx.setpoint();
        if !state.asserted {
            return Ok(false);
        }

        self.sink.apply(&mut tx, state.demand(&self.limits)).await?;

        Ok(true)
    }

    /// Snapshot of the remembered setpoint.
    pub async fn setpoint(&self) -> SetpointState {
        self.conn.transaction().await.setpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedRegisters;
    use crate::transport::RegisterTransport;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const REG_CURRENT: u16 = 261;

    /// Shared current/enable register in deci-amps, zero disables.
    struct DeciAmpSink;

    #[async_trait]
    impl<T: RegisterTransport> SetpointSink<T> for DeciAmpSink {
        async fn apply(&self, tx: &mut Transaction<'_, T>, demand: Demand) -> ChargerResult<()> {
            let raw = match demand {
                Demand::Off => 0,
                Demand::Current(amps) => CurrentEncoding::DeciAmps.encode(amps, 1)? as u16,
            };
            tx.write_register(REG_CURRENT, raw).await
        }

        async fn read_enabled(&self, tx: &mut Transaction<'_, T>) -> ChargerResult<Option<bool>> {
            let regs = tx.read_holding(REG_CURRENT, 1).await?;
            Ok(Some(regs[0] != 0))
        }
    }

    fn controller(sim: &SimulatedRegisters) -> CurrentController<SimulatedRegisters, DeciAmpSink> {
        let conn = Connection::new("test", sim.clone(), Duration::from_secs(1));
        CurrentController::new(conn, DeciAmpSink, CurrentLimits::new().with_max(16.0))
    }

    #[tokio::test]
    async fn test_below_minimum_is_rejected_without_write() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        let err = ctrl.set_max_current(3.0).await.unwrap_err();
        assert!(matches!(err, ChargerError::InvalidArgument { .. }));
        assert!(sim.writes().is_empty());
        assert!(!ctrl.setpoint().await.asserted);
    }

    #[tokio::test]
    async fn test_enable_after_max_current_writes_target() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert_ok!(ctrl.set_max_current(16.0).await);
        assert_ok!(ctrl.enable(true).await);

        assert_eq!(sim.written_values(REG_CURRENT), vec![0, 160]);
        assert!(assert_ok!(ctrl.read_enabled().await));
    }

    #[tokio::test]
    async fn test_enable_without_target_uses_minimum() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert_ok!(ctrl.enable(true).await);
        assert_eq!(sim.written_values(REG_CURRENT), vec![60]);
    }

    #[tokio::test]
    async fn test_disable_writes_sentinel_and_keeps_target() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert_ok!(ctrl.enable(true).await);
        assert_ok!(ctrl.set_max_current(10.0).await);
        assert_ok!(ctrl.enable(false).await);

        assert_eq!(sim.written_values(REG_CURRENT), vec![60, 100, 0]);
        let state = ctrl.setpoint().await;
        assert_eq!(state.target, Some(10.0));
        assert!(!state.enabled);

        assert_ok!(ctrl.reassert().await);
        assert_eq!(sim.written_values(REG_CURRENT).last(), Some(&0));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_setpoint() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert_ok!(ctrl.set_max_current(8.0).await);
        assert_ok!(ctrl.enable(true).await);

        sim.fail_next(ChargerError::connection("link down"));
        assert_err!(ctrl.set_max_current(12.0).await);

        let state = ctrl.setpoint().await;
        assert_eq!(state.target, Some(8.0));

        assert!(assert_ok!(ctrl.reassert().await));
        assert_eq!(sim.written_values(REG_CURRENT).last(), Some(&80));
    }

    #[tokio::test]
    async fn test_failed_enable_keeps_flag() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        sim.fail_next(ChargerError::connection("link down"));
        assert_err!(ctrl.enable(true).await);
        assert!(!ctrl.setpoint().await.enabled);
    }

    #[tokio::test]
    async fn test_zero_current_switches_off() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert_ok!(ctrl.set_max_current(10.0).await);
        assert_ok!(ctrl.enable(true).await);
        assert_ok!(ctrl.set_max_current(0.0).await);

        let state = ctrl.setpoint().await;
        assert!(!state.enabled);
        assert_eq!(state.target, Some(10.0));
        assert_eq!(sim.written_values(REG_CURRENT).last(), Some(&0));
    }

    #[tokio::test]
    async fn test_reassert_before_first_command_is_noop() {
        let sim = SimulatedRegisters::new();
        let ctrl = controller(&sim);

        assert!(!assert_ok!(ctrl.reassert().await));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_enabled_falls_back_to_memory() {
        struct BlindSink;

        #[async_trait]
        impl<T: RegisterTransport> SetpointSink<T> for BlindSink {
            async fn apply(&self, tx: &mut Transaction<'_, T>, demand: Demand) -> ChargerResult<()> {
                tx.write_register(1, u16::from(demand != Demand::Off)).await
            }
        }

        let sim = SimulatedRegisters::new();
        let conn = Connection::new("blind", sim.clone(), Duration::from_secs(1));
        let ctrl = CurrentController::new(conn, BlindSink, CurrentLimits::new());

        assert!(!assert_ok!(ctrl.read_enabled().await));
        assert_ok!(ctrl.enable(true).await);
        assert!(assert_ok!(ctrl.read_enabled().await));
    }

    #[test]
    fn test_encodings() {
        assert_eq!(CurrentEncoding::Amps.encode(16.0, 1).unwrap(), 16);
        assert_eq!(CurrentEncoding::Amps.encode(16.9, 1).unwrap(), 16);
        assert_eq!(CurrentEncoding::DeciAmps.encode(2.3, 1).unwrap(), 23);
        assert_eq!(CurrentEncoding::MilliAmps.encode(6.5, 1).unwrap(), 6500);
        assert_eq!(CurrentEncoding::DutyCycle.encode(6.0, 1).unwrap(), 100);
        assert_eq!(CurrentEncoding::DutyCycle.encode(16.0, 1).unwrap(), 266);
        assert_eq!(CurrentEncoding::nominal_watts().encode(10.0, 3).unwrap(), 6900);
        assert_eq!(CurrentEncoding::nominal_watts().encode(10.0, 1).unwrap(), 2300);
        assert!(CurrentEncoding::Amps.encode(f64::NAN, 1).is_err());
        assert!(CurrentEncoding::Amps.encode(-1.0, 1).is_err());

        assert_eq!(CurrentEncoding::MilliAmps.decode(16000, 1), 16.0);
        assert!(CurrentEncoding::nominal_watts().needs_phases());
    }

    #[test]
    fn test_limits() {
        let limits = CurrentLimits::new();
        assert!(limits.validate(0.0).is_ok());
        assert!(limits.validate(6.0).is_ok());
        assert!(limits.validate(32.0).is_ok());
        assert!(limits.validate(5.99).is_err());
        assert!(limits.validate(32.5).is_err());
        assert!(limits.validate(-1.0).is_err());
        assert!(limits.validate(f64::INFINITY).is_err());
    }

    proptest! {
        #[test]
        fn prop_below_minimum_always_rejected(amps in 0.0001f64..5.9999) {
            let limits = CurrentLimits::new();
            let rejected = matches!(
                limits.validate(amps),
                Err(ChargerError::InvalidArgument { .. })
            );
            prop_assert!(rejected);
        }

        #[test]
        fn prop_encoding_never_over_reports(amps in 6.0f64..32.0, phases in 1u8..=3) {
            for encoding in [
                CurrentEncoding::Amps,
                CurrentEncoding::DeciAmps,
                CurrentEncoding::MilliAmps,
                CurrentEncoding::DutyCycle,
                CurrentEncoding::nominal_watts(),
            ] {
                let raw = encoding.encode(amps, phases).unwrap();
                prop_assert!(encoding.decode(raw, phases) <= amps + 1e-5);
            }
        }
    }
}
