//! # Charge Point Composition
//!
//! A [`ChargePoint`] is the mandatory [`Charger`] surface plus the optional
//! facets its probe confirmed. Facets are trait objects behind `Option`;
//! the composed [`CapabilitySet`] is derived from which ones are attached,
//! so a capability query and a facet call can never disagree.
//!
//! ```rust,no_run
//! # async fn example(point: voltage_evse::ChargePoint) -> voltage_evse::ChargerResult<()> {
//! use voltage_evse::{Capability, Charger};
//!
//! point.max_current(16).await?;
//! point.enable(true).await?;
//!
//! if point.has(Capability::Meter) {
//!     println!("{} W", point.current_power().await?);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capability::{Capability, CapabilitySet};
use crate::error::{ChargerError, ChargerResult};
use crate::facets::{
    Charger, Diagnosis, Identifier, Meter, MeterEnergy, PhaseCurrents, PhaseGetter, PhaseSwitcher,
    PhaseVoltages, Resurrector,
};
use crate::heartbeat::{HeartbeatHandle, WatchdogPolicy};
use crate::status::ChargeStatus;

/// One physical unit, composed once at startup.
pub struct ChargePoint {
    name: String,
    charger: Arc<dyn Charger>,
    capabilities: CapabilitySet,
    meter: Option<Arc<dyn Meter>>,
    meter_energy: Option<Arc<dyn MeterEnergy>>,
    phase_currents: Option<Arc<dyn PhaseCurrents>>,
    phase_voltages: Option<Arc<dyn PhaseVoltages>>,
    phase_switcher: Option<Arc<dyn PhaseSwitcher>>,
    phase_getter: Option<Arc<dyn PhaseGetter>>,
    identifier: Option<Arc<dyn Identifier>>,
    resurrector: Option<Arc<dyn Resurrector>>,
    diagnosis: Option<Arc<dyn Diagnosis>>,
    heartbeat: Option<HeartbeatHandle>,
}

fn require<F: ?Sized>(facet: &Option<Arc<F>>, capability: Capability) -> ChargerResult<&F> {
    facet
        .as_deref()
        .ok_or(ChargerError::unavailable(capability))
}

impl ChargePoint {
    pub fn builder<S: Into<String>>(
        name: S,
        charger: Arc<dyn Charger>,
        probed: CapabilitySet,
    ) -> ChargePointBuilder {
        ChargePointBuilder::new(name, charger, probed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Facets this unit exposes.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    #[inline]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Watchdog policy of the running heartbeat, if any.
    pub fn watchdog(&self) -> Option<WatchdogPolicy> {
        self.heartbeat.as_ref().map(|h| h.policy())
    }

    // ------------------------------------------------------------------------
    // Facet handles
    // ------------------------------------------------------------------------

    pub fn meter(&self) -> Option<&dyn Meter> {
        self.meter.as_deref()
    }

    pub fn meter_energy(&self) -> Option<&dyn MeterEnergy> {
        self.meter_energy.as_deref()
    }

    pub fn phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        self.phase_currents.as_deref()
    }

    pub fn phase_voltages(&self) -> Option<&dyn PhaseVoltages> {
        self.phase_voltages.as_deref()
    }

    pub fn phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        self.phase_switcher.as_deref()
    }

    pub fn phase_getter(&self) -> Option<&dyn PhaseGetter> {
        self.phase_getter.as_deref()
    }

    pub fn identifier(&self) -> Option<&dyn Identifier> {
        self.identifier.as_deref()
    }

    pub fn resurrector(&self) -> Option<&dyn Resurrector> {
        self.resurrector.as_deref()
    }

    pub fn diagnosis(&self) -> Option<&dyn Diagnosis> {
        self.diagnosis.as_deref()
    }

    // ------------------------------------------------------------------------
    // Facet calls, failing with CapabilityUnavailable when not composed
    // ------------------------------------------------------------------------

    pub async fn current_power(&self) -> ChargerResult<f64> {
        require(&self.meter, Capability::Meter)?
            .current_power()
            .await
    }

    pub async fn total_energy(&self) -> ChargerResult<f64> {
        require(&self.meter_energy, Capability::MeterEnergy)?
            .total_energy()
            .await
    }

    pub async fn currents(&self) -> ChargerResult<(f64, f64, f64)> {
        require(&self.phase_currents, Capability::PhaseCurrents)?
            .currents()
            .await
    }

    pub async fn voltages(&self) -> ChargerResult<(f64, f64, f64)> {
        require(&self.phase_voltages, Capability::PhaseVoltages)?
            .voltages()
            .await
    }

    pub async fn phases_1p3p(&self, phases: u8) -> ChargerResult<()> {
        require(&self.phase_switcher, Capability::PhaseSwitch)?
            .phases_1p3p(phases)
            .await
    }

    pub async fn get_phases(&self) -> ChargerResult<u8> {
        require(&self.phase_getter, Capability::PhaseGet)?
            .get_phases()
            .await
    }

    pub async fn identify(&self) -> ChargerResult<String> {
        require(&self.identifier, Capability::Identify)?
            .identify()
            .await
    }

    pub async fn wake_up(&self) -> ChargerResult<()> {
        require(&self.resurrector, Capability::WakeUp)?
            .wake_up()
            .await
    }

    pub async fn diagnose(&self, out: &mut (dyn fmt::Write + Send)) -> ChargerResult<()> {
        require(&self.diagnosis, Capability::Diagnose)?
            .diagnose(out)
            .await
    }

    /// Stop the heartbeat and release the unit.
    ///
    /// Returns once the scheduler has acknowledged the removal; no beat for
    /// this unit runs afterwards.
    pub async fn shutdown(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel().await;
        }
        info!(charger = %self.name, "charge point shut down");
    }
}

#[async_trait]
impl Charger for ChargePoint {
    async fn status(&self) -> ChargerResult<ChargeStatus> {
        self.charger.status().await
    }

    async fn enabled(&self) -> ChargerResult<bool> {
        self.charger.enabled().await
    }

    async fn enable(&self, on: bool) -> ChargerResult<()> {
        self.charger.enable(on).await
    }

    async fn max_current_millis(&self, amps: f64) -> ChargerResult<()> {
        self.charger.max_current_millis(amps).await
    }

    async fn max_current(&self, amps: i64) -> ChargerResult<()> {
        self.charger.max_current(amps).await
    }
}

impl fmt::Debug for ChargePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChargePoint")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("watchdog", &self.watchdog())
            .finish()
    }
}

/// Composes a [`ChargePoint`] from a driver and its probed capabilities.
///
/// A facet offered for a capability the probe did not confirm is dropped.
pub struct ChargePointBuilder {
    name: String,
    charger: Arc<dyn Charger>,
    probed: CapabilitySet,
    composed: CapabilitySet,
    meter: Option<Arc<dyn Meter>>,
    meter_energy: Option<Arc<dyn MeterEnergy>>,
    phase_currents: Option<Arc<dyn PhaseCurrents>>,
    phase_voltages: Option<Arc<dyn PhaseVoltages>>,
    phase_switcher: Option<Arc<dyn PhaseSwitcher>>,
    phase_getter: Option<Arc<dyn PhaseGetter>>,
    identifier: Option<Arc<dyn Identifier>>,
    resurrector: Option<Arc<dyn Resurrector>>,
    diagnosis: Option<Arc<dyn Diagnosis>>,
    heartbeat: Option<HeartbeatHandle>,
}

impl ChargePointBuilder {
    pub fn new<S: Into<String>>(name: S, charger: Arc<dyn Charger>, probed: CapabilitySet) -> Self {
        Self {
            name: name.into(),
            charger,
            probed,
            composed: CapabilitySet::empty(),
            meter: None,
            meter_energy: None,
            phase_currents: None,
            phase_voltages: None,
            phase_switcher: None,
            phase_getter: None,
            identifier: None,
            resurrector: None,
            diagnosis: None,
            heartbeat: None,
        }
    }

    fn admit<F: ?Sized>(&mut self, capability: Capability, facet: Arc<F>) -> Option<Arc<F>> {
        if self.probed.contains(capability) {
            self.composed.insert(capability);
            Some(facet)
        } else {
            debug!(charger = %self.name, %capability, "facet not confirmed by probe, omitted");
            None
        }
    }

    pub fn meter(mut self, facet: Arc<dyn Meter>) -> Self {
        self.meter = self.admit(Capability::Meter, facet);
        self
    }

    pub fn meter_energy(mut self, facet: Arc<dyn MeterEnergy>) -> Self {
        self.meter_energy = self.admit(Capability::MeterEnergy, facet);
        self
    }

    pub fn phase_currents(mut self, facet: Arc<dyn PhaseCurrents>) -> Self {
        self.phase_currents = self.admit(Capability::PhaseCurrents, facet);
        self
    }

    pub fn phase_voltages(mut self, facet: Arc<dyn PhaseVoltages>) -> Self {
        self.phase_voltages = self.admit(Capability::PhaseVoltages, facet);
        self
    }

    pub fn phase_switcher(mut self, facet: Arc<dyn PhaseSwitcher>) -> Self {
        self.phase_switcher = self.admit(Capability::PhaseSwitch, facet);
        self
    }

    pub fn phase_getter(mut self, facet: Arc<dyn PhaseGetter>) -> Self {
        self.phase_getter = self.admit(Capability::PhaseGet, facet);
        self
    }

    pub fn identifier(mut self, facet: Arc<dyn Identifier>) -> Self {
        self.identifier = self.admit(Capability::Identify, facet);
        self
    }

    pub fn resurrector(mut self, facet: Arc<dyn Resurrector>) -> Self {
        self.resurrector = self.admit(Capability::WakeUp, facet);
        self
    }

    pub fn diagnosis(mut self, facet: Arc<dyn Diagnosis>) -> Self {
        self.diagnosis = self.admit(Capability::Diagnose, facet);
        self
    }

    /// Bind a heartbeat registration to the charge point's lifetime.
    pub fn heartbeat(mut self, handle: HeartbeatHandle) -> Self {
        self.heartbeat = Some(handle);
        self
    }

    pub fn build(self) -> ChargePoint {
        info!(
            charger = %self.name,
            capabilities = %self.composed,
            heartbeat = self.heartbeat.is_some(),
            "charge point composed"
        );

        ChargePoint {
            name: self.name,
            charger: self.charger,
            capabilities: self.composed,
            meter: self.meter,
            meter_energy: self.meter_energy,
            phase_currents: self.phase_currents,
            phase_voltages: self.phase_voltages,
            phase_switcher: self.phase_switcher,
            phase_getter: self.phase_getter,
            identifier: self.identifier,
            resurrector: self.resurrector,
            diagnosis: self.diagnosis,
            heartbeat: self.heartbeat,
        }
    }
}
