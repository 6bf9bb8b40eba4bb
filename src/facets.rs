//! Control surface and optional facets of a charge point
//!
//! [`Charger`] is the mandatory surface every driver implements. The
//! remaining traits are optional facets; a [`ChargePoint`](crate::ChargePoint)
//! holds each one behind an `Option` and only when its probe succeeded.

use std::fmt;

use async_trait::async_trait;

use crate::error::{ChargerError, ChargerResult};
use crate::status::ChargeStatus;

/// Mandatory control surface.
#[async_trait]
pub trait Charger: Send + Sync {
    /// Current vehicle/charger state, re-read from hardware.
    async fn status(&self) -> ChargerResult<ChargeStatus>;

    /// Whether the unit currently offers current.
    async fn enabled(&self) -> ChargerResult<bool>;

    /// Switch the unit on at the remembered target, or off.
    async fn enable(&self, on: bool) -> ChargerResult<()>;

    /// Offer `amps`, a fractional value where the unit supports it.
    async fn max_current_millis(&self, amps: f64) -> ChargerResult<()>;

    /// Offer `amps` whole amperes.
    async fn max_current(&self, amps: i64) -> ChargerResult<()> {
        if amps < 0 {
            return Err(ChargerError::invalid_argument(format!(
                "invalid current {}",
                amps
            )));
        }
        self.max_current_millis(amps as f64).await
    }
}

/// Instantaneous charging power in W.
#[async_trait]
pub trait Meter: Send + Sync {
    async fn current_power(&self) -> ChargerResult<f64>;
}

/// Lifetime imported energy in kWh.
#[async_trait]
pub trait MeterEnergy: Send + Sync {
    async fn total_energy(&self) -> ChargerResult<f64>;
}

/// Per-phase currents in A.
#[async_trait]
pub trait PhaseCurrents: Send + Sync {
    async fn currents(&self) -> ChargerResult<(f64, f64, f64)>;
}

/// Per-phase voltages in V.
#[async_trait]
pub trait PhaseVoltages: Send + Sync {
    async fn voltages(&self) -> ChargerResult<(f64, f64, f64)>;
}

/// 1p/3p switching.
#[async_trait]
pub trait PhaseSwitcher: Send + Sync {
    /// Switch to `phases`, which must be 1 or 3.
    async fn phases_1p3p(&self, phases: u8) -> ChargerResult<()>;
}

/// Active phase count.
#[async_trait]
pub trait PhaseGetter: Send + Sync {
    async fn get_phases(&self) -> ChargerResult<u8>;
}

/// Vehicle or RFID identification. An empty string means no id present.
#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(&self) -> ChargerResult<String>;
}

/// Vendor wake-up sequence for vehicles that went to sleep.
#[async_trait]
pub trait Resurrector: Send + Sync {
    async fn wake_up(&self) -> ChargerResult<()>;
}

/// Human-readable dump of diagnostic registers.
#[async_trait]
pub trait Diagnosis: Send + Sync {
    async fn diagnose(&self, out: &mut (dyn fmt::Write + Send)) -> ChargerResult<()>;
}

/// Reject phase counts other than 1 and 3.
pub fn validate_phases(phases: u8) -> ChargerResult<()> {
    match phases {
        1 | 3 => Ok(()),
        n => Err(ChargerError::invalid_argument(format!(
            "invalid phase count {}",
            n
        ))),
    }
}

pub(crate) fn write_failed(_: fmt::Error) -> ChargerError {
    ChargerError::invalid_data("diagnostic output rejected write")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        millis: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl Charger for Recorder {
        async fn status(&self) -> ChargerResult<ChargeStatus> {
            Ok(ChargeStatus::NoVehicle)
        }

        async fn enabled(&self) -> ChargerResult<bool> {
            Ok(false)
        }

        async fn enable(&self, _on: bool) -> ChargerResult<()> {
            Ok(())
        }

        async fn max_current_millis(&self, amps: f64) -> ChargerResult<()> {
            self.millis.lock().unwrap().push(amps);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_max_current_delegates() {
        let charger = Recorder::default();
        charger.max_current(16).await.unwrap();
        assert!(charger.max_current(-1).await.is_err());
        assert_eq!(*charger.millis.lock().unwrap(), vec![16.0]);
    }

    #[test]
    fn test_validate_phases() {
        assert!(validate_phases(1).is_ok());
        assert!(validate_phases(3).is_ok());
        assert!(matches!(
            validate_phases(2),
            Err(ChargerError::InvalidArgument { .. })
        ));
    }
}
