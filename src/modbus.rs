//! Modbus master adapter
//!
//! Bridges a [`voltage_modbus::ModbusClient`] to [`RegisterTransport`] and
//! provides a [`ModbusConnector`] opening TCP (and, with the `rtu` feature,
//! serial RTU) links for the registry.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_evse::config::ChargerConfig;
//! use voltage_evse::modbus::ModbusConnector;
//! use voltage_evse::registry::{BuildContext, Registry};
//! use voltage_evse::HeartbeatScheduler;
//!
//! # async fn example() -> voltage_evse::ChargerResult<()> {
//! let ctx = BuildContext::new(Arc::new(ModbusConnector), HeartbeatScheduler::start());
//! let config: ChargerConfig = serde_json::from_str(
//!     r#"{"name": "garage", "type": "keba-modbus", "settings": {"uri": "192.168.1.20:502"}}"#,
//! )?;
//! let point = Registry::builtin().create(&config, &ctx).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tracing::debug;
use voltage_modbus::{ModbusClient, ModbusError, ModbusTcpClient, SlaveId};

use crate::config::{HttpSettings, ModbusSettings};
use crate::error::{ChargerError, ChargerResult};
use crate::registry::Connector;
use crate::transport::{RegisterKind, RegisterTransport, ValueTransport};

fn map_err(err: ModbusError) -> ChargerError {
    match err {
        // the unit answered, but refused
        ModbusError::Exception { code, .. } => {
            ChargerError::invalid_data(format!("modbus exception {:02X}", code))
        }
        other => ChargerError::connection(other.to_string()),
    }
}

/// One slave on a Modbus master.
pub struct ModbusRegisters<C> {
    client: C,
    unit_id: SlaveId,
}

impl<C: ModbusClient> ModbusRegisters<C> {
    pub fn new(client: C, unit_id: SlaveId) -> Self {
        Self { client, unit_id }
    }

    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }
}

#[async_trait]
impl<C: ModbusClient + 'static> RegisterTransport for ModbusRegisters<C> {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> ChargerResult<Vec<u16>> {
        let result = match kind {
            RegisterKind::Holding => self.client.read_03(self.unit_id, address, count).await,
            RegisterKind::Input => self.client.read_04(self.unit_id, address, count).await,
        };
        result.map_err(map_err)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> ChargerResult<()> {
        self.client
            .write_06(self.unit_id, address, value)
            .await
            .map_err(map_err)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ChargerResult<()> {
        self.client
            .write_10(self.unit_id, address, values)
            .await
            .map_err(map_err)
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> ChargerResult<Vec<bool>> {
        self.client
            .read_01(self.unit_id, address, count)
            .await
            .map_err(map_err)
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> ChargerResult<()> {
        self.client
            .write_05(self.unit_id, address, value)
            .await
            .map_err(map_err)
    }
}

/// Opens Modbus links from [`ModbusSettings`]. Document links are not
/// provided; JSON units need a connector backed by an HTTP client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn registers(
        &self,
        name: &str,
        settings: &ModbusSettings,
        unit_id: u8,
    ) -> ChargerResult<Box<dyn RegisterTransport>> {
        if let Some(uri) = &settings.uri {
            debug!(charger = %name, uri = %uri, unit_id, "opening modbus tcp link");
            let client = ModbusTcpClient::from_address(uri, settings.timeout())
                .await
                .map_err(map_err)?;
            return Ok(Box::new(ModbusRegisters::new(client, unit_id)));
        }

        #[cfg(feature = "rtu")]
        if let Some(device) = &settings.device {
            let baudrate = settings.baudrate.unwrap_or(9600);
            debug!(charger = %name, device = %device, baudrate, unit_id, "opening modbus rtu link");
            let client =
                voltage_modbus::ModbusRtuClient::new(device, baudrate).map_err(map_err)?;
            return Ok(Box::new(ModbusRegisters::new(client, unit_id)));
        }

        Err(ChargerError::configuration(format!(
            "{}: modbus settings need a uri{}",
            name,
            if cfg!(feature = "rtu") { " or device" } else { "" }
        )))
    }

    async fn values(
        &self,
        name: &str,
        _settings: &HttpSettings,
    ) -> ChargerResult<Box<dyn ValueTransport>> {
        Err(ChargerError::configuration(format!(
            "{}: no document transport available",
            name
        )))
    }
}
