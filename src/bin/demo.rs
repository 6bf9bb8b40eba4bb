//! Voltage EVSE Demo
//!
//! Drives a simulated KEBA P30 through the driver registry:
//! - capability probing and composition
//! - status normalization, setpoint writes and enabled readback
//! - the failsafe heartbeat re-asserting the setpoint (time is compressed)
//!
//! Usage: cargo run --features cli --bin demo
//! Logging: RUST_LOG=voltage_evse=debug cargo run --features cli --bin demo

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;
use voltage_evse::config::ChargerConfig;
use voltage_evse::registry::{BuildContext, Registry};
use voltage_evse::sim::{SimulatedConnector, SimulatedRegisters};
use voltage_evse::{Capability, Charger, HeartbeatScheduler};

fn keba_unit() -> SimulatedRegisters {
    let unit = SimulatedRegisters::new();
    // charging state "ready", cable plugged and locked
    unit.set_holding(1000, &[0, 2]);
    unit.set_holding(1004, &[0, 7]);
    // meter
    unit.set_holding(1008, &[0, 10_000, 0, 10_000, 0, 10_000]);
    unit.set_holding(1020, &[0x0070, 0x4E20]);
    unit.set_holding(1036, &[0x0001, 0xE240]);
    unit.set_holding(1040, &[0, 230, 0, 231, 0, 229]);
    // serial, product, firmware
    unit.set_holding(1014, &[0x0131, 0x2D00, 0x0004, 0xA3F2, 0x0003, 0x0A01]);
    // failsafe timeout 2 s so the heartbeat is visible within the demo
    unit.set_holding(1602, &[0, 2]);
    unit
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voltage_evse=info")),
        )
        .init();

    println!("🚀 Voltage EVSE v{} Demo", voltage_evse::VERSION);
    println!("=========================");

    // =========================================================================
    // Part 1: Composition
    // =========================================================================
    println!("\n🧩 Part 1: Registry and capability probing");
    println!("-------------------------------------------");

    let unit = keba_unit();
    let connector = SimulatedConnector::new();
    connector.add_registers("garage", unit.clone());

    let scheduler = HeartbeatScheduler::start();
    let ctx = BuildContext::new(Arc::new(connector), scheduler.clone());
    let registry = Registry::builtin();
    println!("  Registered types: {}", registry.names().join(", "));

    let config = ChargerConfig::new("garage", "keba-modbus", json!({ "uri": "simulated" }));
    let point = registry.create(&config, &ctx).await?;

    println!("  Capabilities: {}", point.capabilities());
    if let Some(policy) = point.watchdog() {
        println!(
            "  Watchdog: timeout {:?}, heartbeat every {:?}",
            policy.timeout(),
            policy.interval()
        );
    }

    // =========================================================================
    // Part 2: Status and measurements
    // =========================================================================
    println!("\n📊 Part 2: Status and measurements");
    println!("-----------------------------------");

    println!("  Status: {:?}", point.status().await?);
    if point.has(Capability::Meter) {
        println!("  Power: {:.1} W", point.current_power().await?);
    }
    if point.has(Capability::MeterEnergy) {
        println!("  Energy: {:.3} kWh", point.total_energy().await?);
    }
    if point.has(Capability::PhaseCurrents) {
        println!("  Currents: {:?} A", point.currents().await?);
    }
    match point.phases_1p3p(1).await {
        Ok(()) => println!("  Switched to 1 phase"),
        Err(e) => println!("  Phase switch: {}", e),
    }

    let mut dump = String::new();
    point.diagnose(&mut dump).await?;
    print!("{}", dump.replace('\t', "  "));

    // =========================================================================
    // Part 3: Setpoints
    // =========================================================================
    println!("\n⚡ Part 3: Setpoints");
    println!("--------------------");

    match point.max_current(3).await {
        Ok(()) => println!("  3 A accepted?!"),
        Err(e) => println!("  3 A rejected: {}", e),
    }
    point.max_current(16).await?;
    point.enable(true).await?;
    println!("  Enabled at 16 A, unit reports enabled = {}", point.enabled().await?);

    // =========================================================================
    // Part 4: Heartbeat
    // =========================================================================
    println!("\n💓 Part 4: Heartbeat");
    println!("--------------------");

    let started = Instant::now();
    sleep(Duration::from_millis(3_500)).await;

    for write in unit.writes().iter().filter(|w| w.address == 5004 || w.address == 5018) {
        println!(
            "  +{:>5}ms  register {} <- {:?}",
            write.at.saturating_duration_since(started).as_millis(),
            write.address,
            write.values
        );
    }

    point.shutdown().await;
    scheduler.shutdown().await;

    println!("\n🎉 Demo completed!");
    Ok(())
}
