//! # Driver Registry
//!
//! Composition root mapping a configured driver type to the factory that
//! builds its [`ChargePoint`]. Factories do not open links themselves;
//! they ask the [`Connector`] in the [`BuildContext`] for a transport, so the
//! same registry serves real Modbus masters and the in-memory simulators.
//!
//! | Type | Driver | Default unit id |
//! |------|--------|-----------------|
//! | `keba-modbus` | [`profiles::keba`] | 255 |
//! | `amperfied` | [`profiles::amperfied`] | 255 |
//! | `abl` | [`profiles::abl`] | 1 |
//! | `vestel` | [`profiles::vestel`] | 255 |
//! | `modbus` | [`profiles::generic`] | 1 |
//! | `openwbpro` | [`JsonCharger`] | - |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::chargepoint::ChargePoint;
use crate::config::{ChargerConfig, HttpSettings, ModbusSettings};
use crate::drivers::json::{JsonCharger, JsonOptions, OPENWB_PATH};
use crate::drivers::profiles::{self, GenericSettings};
use crate::drivers::register::{RegisterCharger, RegisterMap, RegisterOptions};
use crate::error::{ChargerError, ChargerResult};
use crate::heartbeat::HeartbeatScheduler;
use crate::transport::{RegisterTransport, ValueTransport};

/// Opens transports for configured units.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Register link to unit `unit_id`.
    async fn registers(
        &self,
        name: &str,
        settings: &ModbusSettings,
        unit_id: u8,
    ) -> ChargerResult<Box<dyn RegisterTransport>>;

    /// Document link.
    async fn values(
        &self,
        name: &str,
        settings: &HttpSettings,
    ) -> ChargerResult<Box<dyn ValueTransport>>;
}

/// Shared collaborators handed to every factory.
#[derive(Clone)]
pub struct BuildContext {
    pub connector: Arc<dyn Connector>,
    pub scheduler: HeartbeatScheduler,
}

impl BuildContext {
    pub fn new(connector: Arc<dyn Connector>, scheduler: HeartbeatScheduler) -> Self {
        Self {
            connector,
            scheduler,
        }
    }
}

/// Builds one driver type.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn create(&self, config: &ChargerConfig, ctx: &BuildContext)
        -> ChargerResult<ChargePoint>;
}

// ============================================================================
// Built-in factories
// ============================================================================

type ProfileFn = fn(&ChargerConfig) -> ChargerResult<RegisterMap>;

/// Register-mapped unit described by a profile.
pub struct RegisterFactory {
    profile: ProfileFn,
    unit_id: u8,
}

impl RegisterFactory {
    pub fn new(profile: ProfileFn, unit_id: u8) -> Self {
        Self { profile, unit_id }
    }
}

#[async_trait]
impl Factory for RegisterFactory {
    async fn create(
        &self,
        config: &ChargerConfig,
        ctx: &BuildContext,
    ) -> ChargerResult<ChargePoint> {
        let settings: ModbusSettings = config.decode_settings()?;

        let mut map = (self.profile)(config)?;
        if let Some(order) = settings.byte_order {
            map.byte_order = order;
        }

        let options = RegisterOptions {
            timeout: settings.timeout(),
            watchdog: settings.watchdog()?,
            ..RegisterOptions::default()
        };

        let transport = ctx
            .connector
            .registers(&config.name, &settings, settings.unit_id(self.unit_id))
            .await?;

        RegisterCharger::connect(&config.name, transport, map, options, &ctx.scheduler).await
    }
}

/// JSON-document unit.
pub struct JsonFactory;

#[async_trait]
impl Factory for JsonFactory {
    async fn create(
        &self,
        config: &ChargerConfig,
        ctx: &BuildContext,
    ) -> ChargerResult<ChargePoint> {
        let settings: HttpSettings = config.decode_settings()?;

        let defaults = JsonOptions::default();
        let watchdog = match &settings.watchdog {
            Some(watchdog) => Some(watchdog.policy()?),
            None => defaults.watchdog,
        };
        let options = JsonOptions {
            path: settings.path.clone().unwrap_or_else(|| OPENWB_PATH.to_string()),
            timeout: settings.timeout(),
            limits: settings.limits(),
            watchdog,
        };

        let transport = ctx.connector.values(&config.name, &settings).await?;

        JsonCharger::connect(&config.name, transport, options, &ctx.scheduler).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct AmperfiedSettings {
    #[serde(default)]
    phases1p3p: bool,
}

fn keba(_: &ChargerConfig) -> ChargerResult<RegisterMap> {
    Ok(profiles::keba())
}

fn amperfied(config: &ChargerConfig) -> ChargerResult<RegisterMap> {
    let settings: AmperfiedSettings = config.decode_settings()?;
    Ok(profiles::amperfied(settings.phases1p3p))
}

fn abl(_: &ChargerConfig) -> ChargerResult<RegisterMap> {
    Ok(profiles::abl())
}

fn vestel(_: &ChargerConfig) -> ChargerResult<RegisterMap> {
    Ok(profiles::vestel())
}

fn generic(config: &ChargerConfig) -> ChargerResult<RegisterMap> {
    let settings: GenericSettings = config.decode_settings()?;
    profiles::generic(&settings)
}

// ============================================================================
// Registry
// ============================================================================

/// Driver type name to factory.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, Arc<dyn Factory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled driver.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, Arc<dyn Factory>); 6] = [
            ("keba-modbus", Arc::new(RegisterFactory::new(keba, profiles::KEBA_UNIT_ID))),
            ("amperfied", Arc::new(RegisterFactory::new(amperfied, profiles::AMPERFIED_UNIT_ID))),
            ("abl", Arc::new(RegisterFactory::new(abl, profiles::ABL_UNIT_ID))),
            ("vestel", Arc::new(RegisterFactory::new(vestel, profiles::VESTEL_UNIT_ID))),
            ("modbus", Arc::new(RegisterFactory::new(generic, 1))),
            ("openwbpro", Arc::new(JsonFactory)),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        registry
    }

    /// Register `factory` under `name`. Names are unique.
    pub fn add<S: Into<String>>(&mut self, name: S, factory: Arc<dyn Factory>) -> ChargerResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(ChargerError::configuration(format!(
                "driver type {} already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the charge point `config` describes.
    pub async fn create(
        &self,
        config: &ChargerConfig,
        ctx: &BuildContext,
    ) -> ChargerResult<ChargePoint> {
        let factory = self.factories.get(&config.r#type).ok_or_else(|| {
            ChargerError::configuration(format!(
                "{}: unknown charger type {}",
                config.name, config.r#type
            ))
        })?;

        info!(charger = %config.name, kind = %config.r#type, "creating charger");
        factory.create(config, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::facets::Charger;
    use crate::sim::{SimulatedConnector, SimulatedRegisters};
    use crate::status::ChargeStatus;
    use serde_json::json;

    fn context(connector: SimulatedConnector) -> BuildContext {
        BuildContext::new(Arc::new(connector), HeartbeatScheduler::start())
    }

    #[test]
    fn test_builtin_names() {
        let registry = Registry::builtin();
        assert_eq!(
            registry.names(),
            vec!["abl", "amperfied", "keba-modbus", "modbus", "openwbpro", "vestel"]
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = Registry::builtin();
        let err = registry.add("abl", Arc::new(JsonFactory)).unwrap_err();
        assert!(matches!(err, ChargerError::Configuration { .. }));

        assert!(registry.add("custom", Arc::new(JsonFactory)).is_ok());
        assert!(registry.contains("custom"));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let registry = Registry::builtin();
        let ctx = context(SimulatedConnector::new());
        let config = ChargerConfig::new("x", "tesla", json!({}));

        let err = registry.create(&config, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("unknown charger type tesla"));
    }

    #[tokio::test]
    async fn test_create_amperfied_from_simulator() {
        let sim = SimulatedRegisters::new();
        sim.set_input(5, &[4]);
        sim.set_input(10, &[230, 231, 229]);
        sim.set_holding(257, &[20_000]);

        let connector = SimulatedConnector::new();
        connector.add_registers("garage", sim.clone());
        let ctx = context(connector.clone());

        let config = ChargerConfig::new("garage", "amperfied", json!({ "phases1p3p": false }));
        let point = Registry::builtin().create(&config, &ctx).await.unwrap();

        assert_eq!(point.status().await.unwrap(), ChargeStatus::Connected);
        assert!(point.has(Capability::PhaseVoltages));
        assert!(point.has(Capability::WakeUp));
        assert!(!point.has(Capability::PhaseSwitch));
        assert_eq!(point.watchdog().unwrap().interval().as_secs(), 10);
        assert_eq!(connector.unit_id("garage"), Some(255));
    }

    #[tokio::test]
    async fn test_missing_unit_fails() {
        let ctx = context(SimulatedConnector::new());
        let config = ChargerConfig::new("nowhere", "keba-modbus", json!({}));
        let err = Registry::builtin().create(&config, &ctx).await.unwrap_err();
        assert!(err.is_transport_error());
    }
}
