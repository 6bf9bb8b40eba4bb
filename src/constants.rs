//! Charge point constants
//!
//! Vendor-neutral defaults. Drivers override these per profile where the
//! hardware documents something different:
//! - IEC 61851 mandates a minimum PWM-signalled current of 6 A
//! - Modbus register reads are limited to 125 registers per request
//! - Watchdog intervals must leave room for one missed heartbeat

use std::time::Duration;

// ============================================================================
// Current Limits
// ============================================================================

/// Minimum charging current in amperes (IEC 61851 PWM lower bound).
pub const DEFAULT_MIN_CURRENT: f64 = 6.0;

/// Maximum charging current in amperes for a 32 A three-phase unit.
pub const DEFAULT_MAX_CURRENT: f64 = 32.0;

/// Nominal phase voltage used when a current must be expressed as power.
pub const NOMINAL_VOLTAGE: f64 = 230.0;

/// Ampere step of one PWM duty-cycle unit (0.1% duty = 0.06 A).
pub const DUTY_CYCLE_STEP: f64 = 0.06;

// ============================================================================
// Transport
// ============================================================================

/// Default bound on a single transport call (5 seconds).
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Modbus FC03/FC04 register limit per request.
///
/// Response PDU: 1 (function) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Modbus FC16 register limit per request.
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Watchdog
// ============================================================================

/// Divisor applied to a watchdog timeout to derive the heartbeat period.
///
/// With period = timeout / 2 one beat may be lost and the next one still
/// lands inside the same timeout window.
pub const HEARTBEAT_DIVISOR: u32 = 2;

/// Shortest heartbeat period the scheduler accepts.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Duration of a relock wake-up sequence before the unit reports normally again.
pub const DEFAULT_WAKEUP_DURATION: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_constants() {
        assert!(DEFAULT_MIN_CURRENT < DEFAULT_MAX_CURRENT);
        // 6 A is exactly 100 duty-cycle units
        assert_eq!((DEFAULT_MIN_CURRENT / DUTY_CYCLE_STEP).round() as u16, 100);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= 253);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu_size <= 253);
    }

    #[test]
    fn test_heartbeat_divisor() {
        let timeout = Duration::from_secs(10);
        assert!(timeout / HEARTBEAT_DIVISOR <= timeout / 2);
        assert!(MIN_HEARTBEAT_INTERVAL < DEFAULT_TRANSPORT_TIMEOUT);
    }
}
