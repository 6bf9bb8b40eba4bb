#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use voltage_evse::config::ChargerConfig;
use voltage_evse::registry::{BuildContext, Registry};
use voltage_evse::sim::{SimulatedConnector, SimulatedJson, SimulatedRegisters};
use voltage_evse::{ChargePoint, HeartbeatScheduler};

/// Amperfied current register: deci-amps, FC16, zero disables.
pub const AMPERFIED_CURRENT: u16 = 261;
/// Amperfied failsafe timeout register in milliseconds.
pub const AMPERFIED_FAILSAFE: u16 = 257;

pub struct Harness {
    pub connector: SimulatedConnector,
    pub scheduler: HeartbeatScheduler,
    pub ctx: BuildContext,
}

impl Harness {
    pub fn new() -> Self {
        let connector = SimulatedConnector::new();
        let scheduler = HeartbeatScheduler::start();
        let ctx = BuildContext::new(Arc::new(connector.clone()), scheduler.clone());
        Self {
            connector,
            scheduler,
            ctx,
        }
    }

    pub async fn registers(
        &self,
        name: &str,
        kind: &str,
        unit: &SimulatedRegisters,
        settings: Value,
    ) -> ChargePoint {
        self.connector.add_registers(name, unit.clone());
        let config = ChargerConfig::new(name, kind, settings);
        Registry::builtin().create(&config, &self.ctx).await.unwrap()
    }

    pub async fn json(&self, name: &str, unit: &SimulatedJson, settings: Value) -> ChargePoint {
        self.connector.add_json(name, unit.clone());
        let config = ChargerConfig::new(name, "openwbpro", settings);
        Registry::builtin().create(&config, &self.ctx).await.unwrap()
    }
}

/// Amperfied unit with a vehicle connected and the given failsafe timeout.
pub fn amperfied_unit(failsafe_ms: u16) -> SimulatedRegisters {
    let unit = SimulatedRegisters::new();
    unit.set_input(5, &[4]);
    unit.set_input(10, &[230, 231, 229]);
    unit.set_holding(AMPERFIED_FAILSAFE, &[failsafe_ms]);
    unit
}

pub async fn amperfied(harness: &Harness, unit: &SimulatedRegisters) -> ChargePoint {
    harness
        .registers("wallbox", "amperfied", unit, json!({ "uri": "sim" }))
        .await
}

/// A 32-bit value as two big-endian registers.
pub fn u32_regs(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// KEBA unit with a vehicle plugged in. KEBA answers reads aligned to its
/// 32-bit values only.
pub fn keba_unit(product: u32, firmware: u32) -> SimulatedRegisters {
    let unit = SimulatedRegisters::new();
    unit.set_holding(1000, &[0, 2]);
    unit.set_holding(1004, &[0, 7]);
    unit.set_holding(1016, &u32_regs(product));
    unit.set_holding(1018, &u32_regs(firmware));
    for boundary in [1010, 1012, 1042, 1044] {
        unit.fail_reads_across(boundary);
    }
    unit
}

/// Registers holding `text` as zero-padded ASCII.
pub fn ascii_regs(text: &str, count: usize) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(count * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}
