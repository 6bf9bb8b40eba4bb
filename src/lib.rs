//! # Voltage EVSE - Charge Point Control Core
//!
//! Drivers for electric-vehicle charge points that normalize heterogeneous
//! vendor protocols (Modbus register maps, JSON documents) into one control
//! and status contract for an energy-management loop.
//!
//! ## Features
//!
//! - **Canonical status**: vendor codes map onto [`ChargeStatus`]; unknown
//!   codes are errors, never a plausible-looking default
//! - **Single-writer setpoints**: [`CurrentController`] validates, encodes and
//!   remembers the last *accepted* current
//! - **Capability composition**: optional facets are probed once and attached
//!   only when the hardware proved them
//! - **Failsafe heartbeat**: one [`HeartbeatScheduler`] task re-asserts every
//!   unit's setpoint inside its watchdog window
//! - **Serialized links**: every logical operation holds the unit's
//!   connection lock, heartbeats included
//!
//! ## Bundled drivers
//!
//! | Type | Vendor | Transport |
//! |------|--------|-----------|
//! | `keba-modbus` | KEBA KeContact P30/P40 | Modbus TCP |
//! | `amperfied` | Amperfied / Heidelberg | Modbus TCP/RTU |
//! | `abl` | ABL eMH1 | Modbus ASCII/RTU |
//! | `vestel` | Vestel EVC04 | Modbus TCP |
//! | `modbus` | generic, configured register map | Modbus |
//! | `openwbpro` | openWB Pro | HTTP/JSON |
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use voltage_evse::config::ChargerConfig;
//! use voltage_evse::registry::{BuildContext, Registry};
//! use voltage_evse::sim::{SimulatedConnector, SimulatedRegisters};
//! use voltage_evse::{ChargeStatus, Charger, ChargerResult, HeartbeatScheduler};
//!
//! #[tokio::main]
//! async fn main() -> ChargerResult<()> {
//!     let unit = SimulatedRegisters::new();
//!     unit.set_input(5, &[4]);
//!
//!     let connector = SimulatedConnector::new();
//!     connector.add_registers("garage", unit.clone());
//!     let ctx = BuildContext::new(Arc::new(connector), HeartbeatScheduler::start());
//!
//!     let config = ChargerConfig::new("garage", "amperfied", json!({}));
//!     let point = Registry::builtin().create(&config, &ctx).await?;
//!
//!     assert_eq!(point.status().await?, ChargeStatus::Connected);
//!     point.max_current(10).await?;
//!     point.enable(true).await?;
//!     assert_eq!(unit.holding(261), 100);
//!
//!     point.shutdown().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error taxonomy and result type
pub mod error;

/// Vendor-neutral defaults
pub mod constants;

/// Byte order handling and multi-register decoding
pub mod bytes;

/// Canonical charge status and vendor code normalization
pub mod status;

/// Transport boundary and serialized per-unit connections
pub mod transport;

/// Setpoint ownership, validation and vendor unit conversion
pub mod current;

// ============================================================================
// Composition
// ============================================================================

/// Optional facet tags and hardware probing
pub mod capability;

/// Mandatory control surface and optional facet traits
pub mod facets;

/// Charge point aggregate and its builder
pub mod chargepoint;

/// Watchdog policies and the central heartbeat scheduler
pub mod heartbeat;

// ============================================================================
// Drivers and wiring
// ============================================================================

/// Register-map and JSON drivers with vendor profiles
pub mod drivers;

/// Serde-decoded charger configuration
pub mod config;

/// Driver type registry
pub mod registry;

/// In-memory units for tests and demos
pub mod sim;

/// voltage_modbus adapter
#[cfg(feature = "modbus")]
pub mod modbus;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{ChargerError, ChargerResult};

// === Core types ===
pub use bytes::ByteOrder;
pub use capability::{Capability, CapabilitySet};
pub use current::{CurrentController, CurrentEncoding, CurrentLimits, SetpointState};
pub use status::{ChargeStatus, Iec61851Letter, StatusNormalizer, StatusTable};

// === Control surface ===
pub use chargepoint::{ChargePoint, ChargePointBuilder};
pub use facets::{
    Charger, Diagnosis, Identifier, Meter, MeterEnergy, PhaseCurrents, PhaseGetter,
    PhaseSwitcher, PhaseVoltages, Resurrector,
};

// === Heartbeat ===
pub use heartbeat::{Heartbeat, HeartbeatHandle, HeartbeatScheduler, WatchdogPolicy};

// === Transport boundary ===
pub use transport::{Connection, RegisterKind, RegisterTransport, Transaction, ValueTransport};

// === Drivers ===
pub use drivers::{JsonCharger, RegisterCharger, RegisterMap};
pub use registry::{BuildContext, Connector, Registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
