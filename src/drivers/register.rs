//! # Register-Mapped Charge Points
//!
//! [`RegisterCharger`] drives any unit whose control surface is a Modbus
//! register map. Vendor differences are data, captured in a
//! [`RegisterMap`]:
//!
//! | Concern | Map entry |
//! |---------|-----------|
//! | status | [`StatusRegister`] plus optional [`PlugGate`] |
//! | setpoint | [`CurrentRegister`] + [`EnableMode`] |
//! | enabled readback | [`EnabledSource`] |
//! | watchdog | [`FailsafeRegister`], [`KeepAlive`] |
//! | optional facets | measurement registers + [`CapabilityProbe`] |
//!
//! A facet is attached only when the map defines its registers *and* the
//! probe confirmed it on the physical unit.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::bytes::{is_null_sentinel, regs_to_ascii, regs_to_hex, ByteOrder, RegisterFormat};
use crate::capability::{Capability, CapabilityProbe};
use crate::chargepoint::ChargePoint;
use crate::constants::{DEFAULT_TRANSPORT_TIMEOUT, DEFAULT_WAKEUP_DURATION};
use crate::current::{CurrentController, CurrentEncoding, CurrentLimits, Demand, SetpointSink};
use crate::drivers::wakeup::WakeUpWindow;
use crate::error::{ChargerError, ChargerResult};
use crate::facets::{
    validate_phases, write_failed, Charger, Diagnosis, Identifier, Meter, MeterEnergy,
    PhaseCurrents, PhaseGetter, PhaseSwitcher, PhaseVoltages, Resurrector,
};
use crate::heartbeat::{Heartbeat, HeartbeatScheduler, WatchdogPolicy};
use crate::status::{ChargeStatus, StatusNormalizer};
use crate::transport::{Connection, RegisterKind, RegisterTransport, Transaction};

// ============================================================================
// Register map building blocks
// ============================================================================

/// Location and layout of one register-mapped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub kind: RegisterKind,
    pub address: u16,
    pub format: RegisterFormat,
}

impl Field {
    pub const fn holding(address: u16, format: RegisterFormat) -> Self {
        Self {
            kind: RegisterKind::Holding,
            address,
            format,
        }
    }

    pub const fn input(address: u16, format: RegisterFormat) -> Self {
        Self {
            kind: RegisterKind::Input,
            address,
            format,
        }
    }

    pub async fn read<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        order: ByteOrder,
    ) -> ChargerResult<f64> {
        let regs = tx
            .read(self.kind, self.address, self.format.register_count())
            .await?;
        self.format.decode(&regs, order)
    }

    /// Read an unsigned code or counter.
    pub async fn read_raw<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        order: ByteOrder,
    ) -> ChargerResult<u32> {
        Ok(self.read(tx, order).await? as u32)
    }
}

/// A scaled measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    pub field: Field,
    pub scale: f64,
}

impl Quantity {
    pub const fn new(field: Field, scale: f64) -> Self {
        Self { field, scale }
    }

    async fn read<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        order: ByteOrder,
    ) -> ChargerResult<f64> {
        Ok(self.field.read(tx, order).await? * self.scale)
    }
}

/// How the three phase values are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseLayout {
    /// One read covering all three phases.
    #[default]
    Block,
    /// One read per phase; for units that reject reads across value
    /// boundaries or leave gaps between the phase registers.
    PerPhase,
}

/// Three per-phase values at `base`, `base + stride`, `base + 2 * stride`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTriple {
    pub kind: RegisterKind,
    pub base: u16,
    pub stride: u16,
    pub format: RegisterFormat,
    pub scale: f64,
    /// Raw value the unit reports for an idle phase, read as 0.
    pub blank: Option<u16>,
    pub layout: PhaseLayout,
}

impl PhaseTriple {
    async fn read<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        order: ByteOrder,
    ) -> ChargerResult<(f64, f64, f64)> {
        let width = self.format.register_count();

        let phases: Vec<Vec<u16>> = match self.layout {
            PhaseLayout::Block => {
                let regs = tx.read(self.kind, self.base, self.stride * 2 + width).await?;
                (0..3)
                    .map(|i| {
                        let offset = i * self.stride as usize;
                        regs[offset..offset + width as usize].to_vec()
                    })
                    .collect()
            }
            PhaseLayout::PerPhase => {
                let mut phases = Vec::with_capacity(3);
                for i in 0..3 {
                    let address = self.base + i * self.stride;
                    phases.push(tx.read(self.kind, address, width).await?);
                }
                phases
            }
        };

        let mut values = [0.0; 3];
        for (value, regs) in values.iter_mut().zip(&phases) {
            *value = match self.blank {
                Some(blank) if regs[0] == blank => 0.0,
                _ => self.format.decode(regs, order)? * self.scale,
            };
        }

        Ok((values[0], values[1], values[2]))
    }
}

/// Vendor status register and its code table.
#[derive(Clone)]
pub struct StatusRegister {
    pub field: Field,
    pub normalizer: Arc<dyn StatusNormalizer>,
}

/// When a cable-state value means "vehicle plugged in".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugRule {
    /// Any bit of the mask set.
    Mask(u32),
    /// Value at least the threshold.
    AtLeast(u32),
}

impl PlugRule {
    pub fn plugged(&self, raw: u32) -> bool {
        match self {
            Self::Mask(mask) => raw & mask != 0,
            Self::AtLeast(threshold) => raw >= *threshold,
        }
    }
}

/// Cable-state register consulted before the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlugGate {
    pub field: Field,
    pub rule: PlugRule,
}

/// Modbus function used for setpoint writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// FC06.
    #[default]
    Single,
    /// FC16 with a single register.
    Multiple,
}

/// Register receiving the current setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentRegister {
    pub address: u16,
    pub encoding: CurrentEncoding,
    pub mode: WriteMode,
}

/// How "off" is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableMode {
    /// The current register doubles as enable; `sentinel` means off.
    Shared { sentinel: u16 },
    /// Separate enable register written after the current register.
    Register { address: u16, on: u16, off: u16 },
}

/// Where the enabled flag is read back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledSource {
    /// The unit cannot tell; the last accepted flag is reported.
    Memory,
    /// Current register differs from the disable sentinel.
    CurrentRegister,
    /// Status register does not hold one of these codes.
    StatusCodes(&'static [u32]),
}

/// How a phase count is coded in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCoding {
    /// Register holds the phase count; 0 while a switch is in progress.
    Count,
    /// 0 for one phase, non-zero for three.
    Flag,
}

impl PhaseCoding {
    pub fn encode(&self, phases: u8) -> u16 {
        match self {
            Self::Count => u16::from(phases),
            Self::Flag => u16::from(phases == 3),
        }
    }

    pub fn decode(&self, raw: u32) -> ChargerResult<u8> {
        match (self, raw) {
            (Self::Count, 0) => Err(ChargerError::busy("phase switch in progress")),
            (Self::Count, 1..=3) => Ok(raw as u8),
            (Self::Count, n) => Err(ChargerError::invalid_data(format!(
                "invalid phase count {}",
                n
            ))),
            (Self::Flag, 0) => Ok(1),
            (Self::Flag, _) => Ok(3),
        }
    }
}

/// Register reporting the active phase count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRegister {
    pub field: Field,
    pub coding: PhaseCoding,
}

/// Register commanding a 1p/3p switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSwitch {
    pub address: u16,
    pub coding: PhaseCoding,
    pub mode: WriteMode,
}

/// Source of the instantaneous power reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerSource {
    Register(Quantity),
    /// Sum of the phase currents at the given phase voltage.
    FromCurrents { voltage: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdEncoding {
    Hex,
    Ascii,
}

/// RFID / vehicle id registers; all-zero means no id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRegister {
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
    pub encoding: IdEncoding,
}

/// Relock pulse that wakes a sleeping vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeUpSequence {
    pub address: u16,
    pub release: u16,
    pub engage: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Render {
    Number {
        format: RegisterFormat,
        scale: f64,
        unit: &'static str,
    },
    Ascii,
    Hex,
}

/// One line of the diagnostic dump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosticRegister {
    pub label: &'static str,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
    pub render: Render,
}

impl DiagnosticRegister {
    pub const fn number(label: &'static str, field: Field, scale: f64, unit: &'static str) -> Self {
        Self {
            label,
            kind: field.kind,
            address: field.address,
            count: match field.format {
                RegisterFormat::U16 | RegisterFormat::I16 => 1,
                _ => 2,
            },
            render: Render::Number {
                format: field.format,
                scale,
                unit,
            },
        }
    }

    pub const fn text(label: &'static str, kind: RegisterKind, address: u16, count: u16) -> Self {
        Self {
            label,
            kind,
            address,
            count,
            render: Render::Ascii,
        }
    }

    fn render(&self, regs: &[u16], order: ByteOrder) -> ChargerResult<String> {
        match self.render {
            Render::Number {
                format,
                scale,
                unit,
            } => {
                let value = format.decode(regs, order)? * scale;
                Ok(format!("{}{}", (value * 1000.0).round() / 1000.0, unit))
            }
            Render::Ascii => Ok(regs_to_ascii(regs)),
            Render::Hex => Ok(regs_to_hex(regs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Millis,
}

/// Register holding the unit's watchdog timeout. Zero disables the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailsafeRegister {
    pub field: Field,
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveValue {
    Fixed(u16),
    /// The watchdog timeout in seconds.
    TimeoutSeconds,
}

/// Extra register written on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub address: u16,
    pub value: KeepAliveValue,
}

/// One identification read performed before probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantRead {
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
}

impl VariantRead {
    pub const fn holding(address: u16, count: u16) -> Self {
        Self {
            kind: RegisterKind::Holding,
            address,
            count,
        }
    }

    pub const fn input(address: u16, count: u16) -> Self {
        Self {
            kind: RegisterKind::Input,
            address,
            count,
        }
    }
}

/// Adjusts a map to the variant the identification reads revealed. Gets
/// the raw registers of every read, in order.
pub type Refine = fn(RegisterMap, &[Vec<u16>]) -> ChargerResult<RegisterMap>;

/// Hardware variant detection: product lines and firmware generations of
/// one vendor that differ in register layout or feature set. A failing
/// identification read fails construction.
#[derive(Debug, Clone, Copy)]
pub struct Variant {
    pub reads: &'static [VariantRead],
    pub refine: Refine,
}

// ============================================================================
// Register map
// ============================================================================

/// Complete description of one vendor's register interface.
#[derive(Clone)]
pub struct RegisterMap {
    pub vendor: &'static str,
    pub byte_order: ByteOrder,
    pub limits: CurrentLimits,
    pub status: StatusRegister,
    pub plug: Option<PlugGate>,
    pub current: CurrentRegister,
    pub enable: EnableMode,
    pub enabled_from: EnabledSource,
    pub phases: Option<PhaseRegister>,
    pub phase_switch: Option<PhaseSwitch>,
    pub power: Option<PowerSource>,
    pub energy: Option<Quantity>,
    pub currents: Option<PhaseTriple>,
    pub voltages: Option<PhaseTriple>,
    pub identify: Option<IdRegister>,
    pub wake_up: Option<WakeUpSequence>,
    pub diagnostics: Vec<DiagnosticRegister>,
    pub failsafe: Option<FailsafeRegister>,
    /// Watchdog assumed when the unit reports none.
    pub default_watchdog: Option<Duration>,
    pub keep_alive: Option<KeepAlive>,
    pub variant: Option<Variant>,
    pub probes: CapabilityProbe,
}

impl RegisterMap {
    /// Map with the mandatory surface only; the current register doubles as
    /// enable with sentinel 0.
    pub fn new(vendor: &'static str, status: StatusRegister, current: CurrentRegister) -> Self {
        Self {
            vendor,
            byte_order: ByteOrder::BigEndian,
            limits: CurrentLimits::default(),
            status,
            plug: None,
            current,
            enable: EnableMode::Shared { sentinel: 0 },
            enabled_from: EnabledSource::CurrentRegister,
            phases: None,
            phase_switch: None,
            power: None,
            energy: None,
            currents: None,
            voltages: None,
            identify: None,
            wake_up: None,
            diagnostics: Vec::new(),
            failsafe: None,
            default_watchdog: None,
            keep_alive: None,
            variant: None,
            probes: CapabilityProbe::new(),
        }
    }

    fn disable_sentinel(&self) -> u16 {
        match self.enable {
            EnableMode::Shared { sentinel } => sentinel,
            EnableMode::Register { .. } => 0,
        }
    }
}

/// Connection options for a [`RegisterCharger`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterOptions {
    pub timeout: Duration,
    /// Overrides the watchdog read from the unit.
    pub watchdog: Option<WatchdogPolicy>,
    pub wakeup: Duration,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            watchdog: None,
            wakeup: DEFAULT_WAKEUP_DURATION,
        }
    }
}

// ============================================================================
// Setpoint sink
// ============================================================================

/// Writes demands according to a [`RegisterMap`].
pub struct RegisterSetpoint {
    map: Arc<RegisterMap>,
}

impl RegisterSetpoint {
    async fn encode<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        amps: f64,
    ) -> ChargerResult<u16> {
        let encoding = self.map.current.encoding;

        let phases = if encoding.needs_phases() {
            let source = self.map.phases.ok_or_else(|| {
                ChargerError::configuration(format!(
                    "{}: power setpoint needs a phase register",
                    self.map.vendor
                ))
            })?;
            let raw = source.field.read_raw(tx, self.map.byte_order).await?;
            source.coding.decode(raw)?
        } else {
            1
        };

        let raw = encoding.encode(amps, phases)?;
        u16::try_from(raw).map_err(|_| {
            ChargerError::invalid_argument(format!("setpoint {} exceeds register range", raw))
        })
    }

    async fn write_current<T: RegisterTransport>(
        &self,
        tx: &mut Transaction<'_, T>,
        raw: u16,
    ) -> ChargerResult<()> {
        let register = &self.map.current;
        match register.mode {
            WriteMode::Single => tx.write_register(register.address, raw).await,
            WriteMode::Multiple => tx.write_registers(register.address, &[raw]).await,
        }
    }
}

#[async_trait]
impl<T: RegisterTransport> SetpointSink<T> for RegisterSetpoint {
    async fn apply(&self, tx: &mut Transaction<'_, T>, demand: Demand) -> ChargerResult<()> {
        match (self.map.enable, demand) {
            (EnableMode::Shared { sentinel }, Demand::Off) => self.write_current(tx, sentinel).await,
            (EnableMode::Shared { .. }, Demand::Current(amps)) => {
                let raw = self.encode(tx, amps).await?;
                self.write_current(tx, raw).await
            }
            (EnableMode::Register { address, off, .. }, Demand::Off) => {
                tx.write_register(address, off).await
            }
            (EnableMode::Register { address, on, .. }, Demand::Current(amps)) => {
                let raw = self.encode(tx, amps).await?;
                self.write_current(tx, raw).await?;
                tx.write_register(address, on).await
            }
        }
    }

    async fn read_enabled(&self, tx: &mut Transaction<'_, T>) -> ChargerResult<Option<bool>> {
        match self.map.enabled_from {
            EnabledSource::Memory => Ok(None),
            EnabledSource::CurrentRegister => {
                let regs = tx.read_holding(self.map.current.address, 1).await?;
                Ok(Some(regs[0] != self.map.disable_sentinel()))
            }
            EnabledSource::StatusCodes(disabled) => {
                let raw = self
                    .map
                    .status
                    .field
                    .read_raw(tx, self.map.byte_order)
                    .await?;
                Ok(Some(!disabled.contains(&raw)))
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Charge point driven through a [`RegisterMap`].
pub struct RegisterCharger<T> {
    map: Arc<RegisterMap>,
    controller: CurrentController<T, RegisterSetpoint>,
    wakeup: WakeUpWindow,
    watchdog: Option<WatchdogPolicy>,
    /// Last commanded phase count, 0 before the first switch.
    phases: AtomicU8,
}

impl<T: RegisterTransport + 'static> RegisterCharger<T> {
    /// Probe the unit, compose its charge point and register its heartbeat.
    ///
    /// Optional facet probes never fail construction. A failing read of the
    /// failsafe-timeout register does: without it the heartbeat period is
    /// unknown.
    pub async fn connect(
        name: &str,
        transport: T,
        map: RegisterMap,
        options: RegisterOptions,
        scheduler: &HeartbeatScheduler,
    ) -> ChargerResult<ChargePoint> {
        let conn = Connection::new(name, transport, options.timeout);
        let map = match map.variant {
            Some(variant) => detect_variant(&conn, map, variant).await?,
            None => map,
        };
        let map = Arc::new(map);

        let probed = map.probes.run(&conn).await;
        let watchdog = match options.watchdog {
            Some(policy) => Some(policy),
            None => read_watchdog(&conn, &map).await?,
        };

        let charger = Arc::new(Self {
            controller: CurrentController::new(
                conn,
                RegisterSetpoint {
                    map: Arc::clone(&map),
                },
                map.limits,
            ),
            map: Arc::clone(&map),
            wakeup: WakeUpWindow::new(options.wakeup),
            watchdog,
            phases: AtomicU8::new(0),
        });

        let mut builder = ChargePoint::builder(name, charger.clone(), probed);
        if map.power.is_some() {
            builder = builder.meter(charger.clone());
        }
        if map.energy.is_some() {
            builder = builder.meter_energy(charger.clone());
        }
        if map.currents.is_some() {
            builder = builder.phase_currents(charger.clone());
        }
        if map.voltages.is_some() {
            builder = builder.phase_voltages(charger.clone());
        }
        if map.phase_switch.is_some() {
            builder = builder.phase_switcher(charger.clone());
        }
        if map.phases.is_some() {
            builder = builder.phase_getter(charger.clone());
        }
        if map.identify.is_some() {
            builder = builder.identifier(charger.clone());
        }
        if map.wake_up.is_some() {
            builder = builder.resurrector(charger.clone());
        }
        if !map.diagnostics.is_empty() {
            builder = builder.diagnosis(charger.clone());
        }

        if let Some(policy) = watchdog {
            let handle = scheduler.register(name, policy, charger)?;
            builder = builder.heartbeat(handle);
        }

        Ok(builder.build())
    }
}

async fn detect_variant<T: RegisterTransport>(
    conn: &Connection<T>,
    map: RegisterMap,
    variant: Variant,
) -> ChargerResult<RegisterMap> {
    let mut values = Vec::with_capacity(variant.reads.len());
    {
        let mut tx = conn.transaction().await;
        for read in variant.reads {
            values.push(tx.read(read.kind, read.address, read.count).await?);
        }
    }

    let map = (variant.refine)(map, &values)?;
    debug!(charger = %conn.name(), vendor = map.vendor, "hardware variant applied");
    Ok(map)
}

async fn read_watchdog<T: RegisterTransport>(
    conn: &Connection<T>,
    map: &RegisterMap,
) -> ChargerResult<Option<WatchdogPolicy>> {
    let timeout = match map.failsafe {
        Some(failsafe) => {
            let raw = {
                let mut tx = conn.transaction().await;
                failsafe.field.read_raw(&mut tx, map.byte_order).await?
            };
            match failsafe.unit {
                TimeUnit::Seconds => Duration::from_secs(u64::from(raw)),
                TimeUnit::Millis => Duration::from_millis(u64::from(raw)),
            }
        }
        None => Duration::ZERO,
    };

    let timeout = match (timeout.is_zero(), map.default_watchdog) {
        (false, _) => timeout,
        (true, Some(default)) => default,
        (true, None) => {
            info!(charger = %conn.name(), "unit reports no failsafe timeout, heartbeat disabled");
            return Ok(None);
        }
    };

    debug!(charger = %conn.name(), timeout_ms = timeout.as_millis() as u64, "watchdog detected");
    WatchdogPolicy::from_timeout(timeout).map(Some)
}

impl<T: RegisterTransport> RegisterCharger<T> {
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn connection(&self) -> &Connection<T> {
        self.controller.connection()
    }

    async fn transaction(&self) -> Transaction<'_, T> {
        self.controller.connection().transaction().await
    }

    async fn read_currents(&self) -> ChargerResult<(f64, f64, f64)> {
        let triple = self
            .map
            .currents
            .ok_or(ChargerError::unavailable(Capability::PhaseCurrents))?;
        let mut tx = self.transaction().await;
        triple.read(&mut tx, self.map.byte_order).await
    }
}

#[async_trait]
impl<T: RegisterTransport> Charger for RegisterCharger<T> {
    async fn status(&self) -> ChargerResult<ChargeStatus> {
        let order = self.map.byte_order;

        let raw = {
            let mut tx = self.transaction().await;

            if let Some(gate) = self.map.plug {
                let cable = gate.field.read_raw(&mut tx, order).await?;
                if !gate.rule.plugged(cable) {
                    self.wakeup.settle(ChargeStatus::NoVehicle);
                    return Ok(ChargeStatus::NoVehicle);
                }
            }

            self.map.status.field.read_raw(&mut tx, order).await?
        };

        let status = self.map.status.normalizer.normalize(raw)?;
        Ok(self.wakeup.settle(status))
    }

    async fn enabled(&self) -> ChargerResult<bool> {
        self.controller.read_enabled().await
    }

    async fn enable(&self, on: bool) -> ChargerResult<()> {
        self.controller.enable(on).await
    }

    async fn max_current_millis(&self, amps: f64) -> ChargerResult<()> {
        self.controller.set_max_current(amps).await
    }
}

#[async_trait]
impl<T: RegisterTransport> Heartbeat for RegisterCharger<T> {
    async fn beat(&self) -> ChargerResult<()> {
        self.controller.reassert().await?;

        if let Some(keep_alive) = self.map.keep_alive {
            let value = match keep_alive.value {
                KeepAliveValue::Fixed(value) => value,
                KeepAliveValue::TimeoutSeconds => self
                    .watchdog
                    .map(|w| w.timeout().as_secs().min(u64::from(u16::MAX)) as u16)
                    .unwrap_or(0),
            };
            self.transaction()
                .await
                .write_register(keep_alive.address, value)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl<T: RegisterTransport> Meter for RegisterCharger<T> {
    async fn current_power(&self) -> ChargerResult<f64> {
        match self.map.power {
            Some(PowerSource::Register(quantity)) => {
                let mut tx = self.transaction().await;
                quantity.read(&mut tx, self.map.byte_order).await
            }
            Some(PowerSource::FromCurrents { voltage }) => {
                let (l1, l2, l3) = self.read_currents().await?;
                Ok(voltage * (l1 + l2 + l3))
            }
            None => Err(ChargerError::unavailable(Capability::Meter)),
        }
    }
}

#[async_trait]
impl<T: RegisterTransport> MeterEnergy for RegisterCharger<T> {
    async fn total_energy(&self) -> ChargerResult<f64> {
        let quantity = self
            .map
            .energy
            .ok_or(ChargerError::unavailable(Capability::MeterEnergy))?;
        let mut tx = self.transaction().await;
        quantity.read(&mut tx, self.map.byte_order).await
    }
}

#[async_trait]
impl<T: RegisterTransport> PhaseCurrents for RegisterCharger<T> {
    async fn currents(&self) -> ChargerResult<(f64, f64, f64)> {
        self.read_currents().await
    }
}

#[async_trait]
impl<T: RegisterTransport> PhaseVoltages for RegisterCharger<T> {
    async fn voltages(&self) -> ChargerResult<(f64, f64, f64)> {
        let triple = self
            .map
            .voltages
            .ok_or(ChargerError::unavailable(Capability::PhaseVoltages))?;
        let mut tx = self.transaction().await;
        triple.read(&mut tx, self.map.byte_order).await
    }
}

#[async_trait]
impl<T: RegisterTransport> PhaseSwitcher for RegisterCharger<T> {
    async fn phases_1p3p(&self, phases: u8) -> ChargerResult<()> {
        validate_phases(phases)?;
        let switch = self
            .map
            .phase_switch
            .ok_or(ChargerError::unavailable(Capability::PhaseSwitch))?;

        let mut tx = self.transaction().await;

        // a counting phase register reads 0 until the contactor settled
        if let Some(register) = self.map.phases.filter(|r| r.coding == PhaseCoding::Count) {
            let raw = register.field.read_raw(&mut tx, self.map.byte_order).await?;
            register.coding.decode(raw)?;
        }

        let value = switch.coding.encode(phases);
        match switch.mode {
            WriteMode::Single => tx.write_register(switch.address, value).await?,
            WriteMode::Multiple => tx.write_registers(switch.address, &[value]).await?,
        }
        self.phases.store(phases, Ordering::Relaxed);
        debug!(charger = %self.connection().name(), phases, "phase switch requested");

        Ok(())
    }
}

#[async_trait]
impl<T: RegisterTransport> PhaseGetter for RegisterCharger<T> {
    async fn get_phases(&self) -> ChargerResult<u8> {
        let register = self
            .map
            .phases
            .ok_or(ChargerError::unavailable(Capability::PhaseGet))?;
        let raw = {
            let mut tx = self.transaction().await;
            register.field.read_raw(&mut tx, self.map.byte_order).await?
        };

        match register.coding.decode(raw) {
            Err(ChargerError::Busy { .. }) if self.phases.load(Ordering::Relaxed) != 0 => {
                let commanded = self.phases.load(Ordering::Relaxed);
                debug!(charger = %self.connection().name(), commanded, "phase switch in progress");
                Ok(commanded)
            }
            result => result,
        }
    }
}

#[async_trait]
impl<T: RegisterTransport> Identifier for RegisterCharger<T> {
    async fn identify(&self) -> ChargerResult<String> {
        let id = self
            .map
            .identify
            .ok_or(ChargerError::unavailable(Capability::Identify))?;
        let regs = self
            .transaction()
            .await
            .read(id.kind, id.address, id.count)
            .await?;

        if is_null_sentinel(&regs) {
            return Ok(String::new());
        }

        Ok(match id.encoding {
            IdEncoding::Hex => regs_to_hex(&regs),
            IdEncoding::Ascii => regs_to_ascii(&regs),
        })
    }
}

#[async_trait]
impl<T: RegisterTransport> Resurrector for RegisterCharger<T> {
    async fn wake_up(&self) -> ChargerResult<()> {
        let sequence = self
            .map
            .wake_up
            .ok_or(ChargerError::unavailable(Capability::WakeUp))?;

        let mut tx = self.transaction().await;
        tx.write_register(sequence.address, sequence.release).await?;
        self.wakeup.open();
        tx.write_register(sequence.address, sequence.engage).await
    }
}

#[async_trait]
impl<T: RegisterTransport> Diagnosis for RegisterCharger<T> {
    async fn diagnose(&self, out: &mut (dyn fmt::Write + Send)) -> ChargerResult<()> {
        writeln!(out, "{}:", self.map.vendor).map_err(write_failed)?;

        for register in &self.map.diagnostics {
            let result = self
                .transaction()
                .await
                .read(register.kind, register.address, register.count)
                .await;

            let rendered = match result {
                Ok(regs) => register.render(&regs, self.map.byte_order),
                Err(e) => Err(e),
            };

            match rendered {
                Ok(text) => writeln!(out, "\t{}:\t{}", register.label, text).map_err(write_failed)?,
                Err(e) => debug!(label = register.label, error = %e, "diagnostic read skipped"),
            }
        }

        Ok(())
    }
}
