//! # JSON-Document Charge Points
//!
//! [`JsonCharger`] drives units exposing a single status document over a
//! [`ValueTransport`], in the style of the openWB Pro `connect.php`
//! endpoint:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `plug_state` | vehicle plugged in |
//! | `charge_state` | vehicle drawing current |
//! | `offered_current` | current offered in A, 0 when off |
//! | `power_all` | power in W |
//! | `imported` | lifetime energy in Wh |
//! | `currents`, `voltages` | three-element arrays |
//! | `phases_actual` | active phase count |
//! | `vehicle_id`, `rfid_tag` | identification, `"--"` when absent |
//!
//! Setpoints are posted as `{"ampere": <A>}`, phase switches as
//! `{"phasetarget": <n>}`. Optional facets are attached when the first
//! document carries their keys.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::capability::{Capability, CapabilitySet};
use crate::chargepoint::ChargePoint;
use crate::constants::DEFAULT_TRANSPORT_TIMEOUT;
use crate::current::{CurrentController, CurrentLimits, Demand, SetpointSink};
use crate::error::{ChargerError, ChargerResult};
use crate::facets::{
    validate_phases, write_failed, Charger, Diagnosis, Identifier, Meter, MeterEnergy,
    PhaseCurrents, PhaseGetter, PhaseSwitcher, PhaseVoltages,
};
use crate::heartbeat::{Heartbeat, HeartbeatScheduler, WatchdogPolicy};
use crate::status::ChargeStatus;
use crate::transport::{Connection, Transaction, ValueTransport};

/// Status and control endpoint of an openWB Pro.
pub const OPENWB_PATH: &str = "connect.php";

/// The openWB Pro falls back to its own limit after a minute without
/// setpoints.
pub const OPENWB_WATCHDOG: Duration = Duration::from_secs(60);

/// Marker the unit reports for "no vehicle id".
const NO_ID: &str = "--";

// ============================================================================
// Document access
// ============================================================================

fn field<'a>(doc: &'a Value, key: &str) -> ChargerResult<&'a Value> {
    doc.get(key)
        .ok_or_else(|| ChargerError::invalid_data(format!("missing key {}", key)))
}

fn number(doc: &Value, key: &str) -> ChargerResult<f64> {
    field(doc, key)?
        .as_f64()
        .ok_or_else(|| ChargerError::invalid_data(format!("{} is not a number", key)))
}

fn flag(doc: &Value, key: &str) -> ChargerResult<bool> {
    match field(doc, key)? {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        _ => Err(ChargerError::invalid_data(format!("{} is not a flag", key))),
    }
}

fn triple(doc: &Value, key: &str) -> ChargerResult<(f64, f64, f64)> {
    let values: Vec<f64> = field(doc, key)?
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();

    match values.as_slice() {
        [l1, l2, l3] => Ok((*l1, *l2, *l3)),
        _ => Err(ChargerError::invalid_data(format!(
            "{} is not a three-phase array",
            key
        ))),
    }
}

fn text<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    doc.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != NO_ID)
}

/// Facets the document layout supports.
pub fn capabilities_of(doc: &Value) -> CapabilitySet {
    let has = |key: &str| doc.get(key).is_some_and(|v| !v.is_null());

    let mut set = CapabilitySet::empty().with(Capability::PhaseSwitch);
    if has("power_all") {
        set.insert(Capability::Meter);
    }
    if has("imported") {
        set.insert(Capability::MeterEnergy);
    }
    if has("currents") {
        set.insert(Capability::PhaseCurrents);
    }
    if has("voltages") {
        set.insert(Capability::PhaseVoltages);
    }
    if has("phases_actual") {
        set.insert(Capability::PhaseGet);
    }
    if has("vehicle_id") || has("rfid_tag") {
        set.insert(Capability::Identify);
    }
    if doc.is_object() {
        set.insert(Capability::Diagnose);
    }
    set
}

// ============================================================================
// Setpoint sink
// ============================================================================

/// Posts current demands; zero amperes means off.
pub struct JsonSetpoint {
    path: String,
}

#[async_trait]
impl<T: ValueTransport> SetpointSink<T> for JsonSetpoint {
    async fn apply(&self, tx: &mut Transaction<'_, T>, demand: Demand) -> ChargerResult<()> {
        let amps = match demand {
            Demand::Off => 0.0,
            Demand::Current(amps) => (amps * 100.0 + 1e-6).floor() / 100.0,
        };
        tx.post(&self.path, json!({ "ampere": amps })).await
    }

    async fn read_enabled(&self, tx: &mut Transaction<'_, T>) -> ChargerResult<Option<bool>> {
        let doc = tx.get(&self.path).await?;
        Ok(Some(number(&doc, "offered_current")? > 0.0))
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Connection options for a [`JsonCharger`].
#[derive(Debug, Clone, PartialEq)]
pub struct JsonOptions {
    pub path: String,
    pub timeout: Duration,
    pub limits: CurrentLimits,
    /// `None` disables the heartbeat.
    pub watchdog: Option<WatchdogPolicy>,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            path: OPENWB_PATH.to_string(),
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
            limits: CurrentLimits::default(),
            watchdog: WatchdogPolicy::from_timeout(OPENWB_WATCHDOG).ok(),
        }
    }
}

/// Charge point driven through a JSON status document.
pub struct JsonCharger<T> {
    path: String,
    controller: CurrentController<T, JsonSetpoint>,
}

impl<T: ValueTransport + 'static> JsonCharger<T> {
    /// Fetch the status document, compose the charge point and register
    /// its heartbeat. An unreachable unit yields a charge point without
    /// optional facets.
    pub async fn connect(
        name: &str,
        transport: T,
        options: JsonOptions,
        scheduler: &HeartbeatScheduler,
    ) -> ChargerResult<ChargePoint> {
        let conn = Connection::new(name, transport, options.timeout);

        let probed = {
            let mut tx = conn.transaction().await;
            match tx.get(&options.path).await {
                Ok(doc) => capabilities_of(&doc),
                Err(e) => {
                    warn!(charger = %name, error = %e, "status document unavailable, no optional facets");
                    CapabilitySet::empty()
                }
            }
        };

        let charger = Arc::new(Self {
            path: options.path.clone(),
            controller: CurrentController::new(
                conn,
                JsonSetpoint { path: options.path },
                options.limits,
            ),
        });

        let mut builder = ChargePoint::builder(name, charger.clone(), probed)
            .meter(charger.clone())
            .meter_energy(charger.clone())
            .phase_currents(charger.clone())
            .phase_voltages(charger.clone())
            .phase_switcher(charger.clone())
            .phase_getter(charger.clone())
            .identifier(charger.clone())
            .diagnosis(charger.clone());

        if let Some(policy) = options.watchdog {
            let handle = scheduler.register(name, policy, charger)?;
            builder = builder.heartbeat(handle);
        }

        Ok(builder.build())
    }
}

impl<T: ValueTransport> JsonCharger<T> {
    pub fn connection(&self) -> &Connection<T> {
        self.controller.connection()
    }

    async fn document(&self) -> ChargerResult<Value> {
        self.controller
            .connection()
            .transaction()
            .await
            .get(&self.path)
            .await
    }
}

#[async_trait]
impl<T: ValueTransport> Charger for JsonCharger<T> {
    async fn status(&self) -> ChargerResult<ChargeStatus> {
        let doc = self.document().await?;

        if !flag(&doc, "plug_state")? {
            return Ok(ChargeStatus::NoVehicle);
        }
        if flag(&doc, "charge_state")? {
            return Ok(ChargeStatus::Charging);
        }
        Ok(ChargeStatus::Connected)
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
impl<T: ValueTransport> Heartbeat for JsonCharger<T> {
    async fn beat(&self) -> ChargerResult<()> {
        self.controller.reassert().await.map(|_| ())
    }
}

#[async_trait]
impl<T: ValueTransport> Meter for JsonCharger<T> {
    async fn current_power(&self) -> ChargerResult<f64> {
        number(&self.document().await?, "power_all")
    }
}

#[async_trait]
impl<T: ValueTransport> MeterEnergy for JsonCharger<T> {
    async fn total_energy(&self) -> ChargerResult<f64> {
        Ok(number(&self.document().await?, "imported")? / 1e3)
    }
}

#[async_trait]
impl<T: ValueTransport> PhaseCurrents for JsonCharger<T> {
    async fn currents(&self) -> ChargerResult<(f64, f64, f64)> {
        triple(&self.document().await?, "currents")
    }
}

#[async_trait]
impl<T: ValueTransport> PhaseVoltages for JsonCharger<T> {
    async fn voltages(&self) -> ChargerResult<(f64, f64, f64)> {
        triple(&self.document().await?, "voltages")
    }
}

#[async_trait]
impl<T: ValueTransport> PhaseSwitcher for JsonCharger<T> {
    async fn phases_1p3p(&self, phases: u8) -> ChargerResult<()> {
        validate_phases(phases)?;
        self.controller
            .connection()
            .transaction()
            .await
            .post(&self.path, json!({ "phasetarget": phases }))
            .await?;
        debug!(charger = %self.connection().name(), phases, "phase switch requested");
        Ok(())
    }
}

#[async_trait]
impl<T: ValueTransport> PhaseGetter for JsonCharger<T> {
    async fn get_phases(&self) -> ChargerResult<u8> {
        match number(&self.document().await?, "phases_actual")? as u8 {
            0 => Err(ChargerError::busy("phase switch in progress")),
            n @ 1..=3 => Ok(n),
            n => Err(ChargerError::invalid_data(format!("invalid phase count {}", n))),
        }
    }
}

#[async_trait]
impl<T: ValueTransport> Identifier for JsonCharger<T> {
    async fn identify(&self) -> ChargerResult<String> {
        let doc = self.document().await?;
        // a "--" vehicle id means no vehicle, even with a tag presented
        if doc.get("vehicle_id").and_then(Value::as_str) == Some(NO_ID) {
            return Ok(String::new());
        }
        Ok(text(&doc, "vehicle_id")
            .or_else(|| text(&doc, "rfid_tag"))
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl<T: ValueTransport> Diagnosis for JsonCharger<T> {
    async fn diagnose(&self, out: &mut (dyn fmt::Write + Send)) -> ChargerResult<()> {
        let doc = self.document().await?;
        writeln!(out, "{}:", self.connection().name()).map_err(write_failed)?;

        if let Some(object) = doc.as_object() {
            for (key, value) in object {
                writeln!(out, "\t{}:\t{}", key, value).map_err(write_failed)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedJson;
    use tokio_test::assert_ok;

    fn document() -> Value {
        json!({
            "plug_state": true,
            "charge_state": false,
            "offered_current": 0,
            "power_all": 7360.5,
            "imported": 12345.0,
            "currents": [10.1, 10.2, 10.3],
            "voltages": [230.0, 231.0, 229.0],
            "phases_actual": 3,
            "vehicle_id": "--",
            "rfid_tag": ""
        })
    }

    async fn connect(sim: &SimulatedJson) -> ChargePoint {
        let scheduler = HeartbeatScheduler::start();
        let options = JsonOptions {
            watchdog: None,
            ..JsonOptions::default()
        };
        JsonCharger::connect("pro", sim.clone(), options, &scheduler)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_from_flags() {
        let sim = SimulatedJson::new();
        sim.set(OPENWB_PATH, document());
        let point = connect(&sim).await;

        assert_eq!(point.status().await.unwrap(), ChargeStatus::Connected);

        let mut doc = document();
        doc["charge_state"] = json!(true);
        sim.set(OPENWB_PATH, doc);
        assert_eq!(point.status().await.unwrap(), ChargeStatus::Charging);

        let mut doc = document();
        doc["plug_state"] = json!(false);
        doc["charge_state"] = json!(true);
        sim.set(OPENWB_PATH, doc);
        assert_eq!(point.status().await.unwrap(), ChargeStatus::NoVehicle);
    }

    #[tokio::test]
    async fn test_setpoint_posts_ampere() {
        let sim = SimulatedJson::new();
        sim.set(OPENWB_PATH, document());
        let point = connect(&sim).await;

        assert_ok!(point.max_current_millis(10.5).await);
        assert_ok!(point.enable(true).await);
        assert_ok!(point.enable(false).await);

        let bodies: Vec<Value> = sim.posts().into_iter().map(|p| p.body).collect();
        assert_eq!(
            bodies,
            vec![json!({"ampere": 0.0}), json!({"ampere": 10.5}), json!({"ampere": 0.0})]
        );
        assert!(!point.enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_facets_from_document_keys() {
        let sim = SimulatedJson::new();
        sim.set(OPENWB_PATH, document());
        let point = connect(&sim).await;

        assert!(point.has(Capability::Meter));
        assert!(point.has(Capability::PhaseGet));
        assert_eq!(point.current_power().await.unwrap(), 7360.5);
        assert_eq!(point.total_energy().await.unwrap(), 12.345);
        assert_eq!(point.currents().await.unwrap(), (10.1, 10.2, 10.3));
        assert_eq!(point.get_phases().await.unwrap(), 3);
        assert_eq!(point.identify().await.unwrap(), "");

        assert_ok!(point.phases_1p3p(1).await);
        assert_eq!(sim.posts()[0].body, json!({"phasetarget": 1}));
        assert!(point.phases_1p3p(2).await.is_err());
    }

    #[tokio::test]
    async fn test_identify_prefers_vehicle_id() {
        let sim = SimulatedJson::new();
        let mut doc = document();
        doc["rfid_tag"] = json!("04a2beef");
        sim.set(OPENWB_PATH, doc.clone());
        let point = connect(&sim).await;

        assert_eq!(point.identify().await.unwrap(), "");

        doc["vehicle_id"] = json!("WVWZZZ1JZ3W386752");
        sim.set(OPENWB_PATH, doc.clone());
        assert_eq!(point.identify().await.unwrap(), "WVWZZZ1JZ3W386752");

        doc["vehicle_id"] = json!("");
        sim.set(OPENWB_PATH, doc);
        assert_eq!(point.identify().await.unwrap(), "04a2beef");
    }

    #[tokio::test]
    async fn test_phase_switch_in_progress_is_busy() {
        let sim = SimulatedJson::new();
        let mut doc = document();
        doc["phases_actual"] = json!(0);
        sim.set(OPENWB_PATH, doc);
        let point = connect(&sim).await;

        assert!(matches!(
            point.get_phases().await,
            Err(ChargerError::Busy { .. })
        ));
    }

    #[tokio::test]
    async fn test_sparse_document_omits_facets() {
        let sim = SimulatedJson::new();
        sim.set(
            OPENWB_PATH,
            json!({"plug_state": false, "charge_state": false, "offered_current": 6}),
        );
        let point = connect(&sim).await;

        assert!(!point.has(Capability::Meter));
        assert!(!point.has(Capability::PhaseCurrents));
        assert!(matches!(
            point.current_power().await,
            Err(ChargerError::CapabilityUnavailable { .. })
        ));
        assert!(point.enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_unit_still_composes() {
        let sim = SimulatedJson::new();
        let point = connect(&sim).await;

        assert!(point.capabilities().is_empty());
        assert!(point.status().await.is_err());
    }
}
