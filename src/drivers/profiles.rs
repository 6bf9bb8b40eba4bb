//! Built-in vendor register maps
//!
//! | Profile | Transport | Setpoint | Watchdog |
//! |---------|-----------|----------|----------|
//! | [`keba`] | TCP, unit 255 | mA + enable register (P40: mA only) | 1602 (s), keep-alive 5018 |
//! | [`amperfied`] | TCP, unit 255 | 0.1 A, FC16 | 257 (ms) |
//! | [`abl`] | RTU/ASCII, unit 1 | PWM duty cycle, off = 0x03E8 | none |
//! | [`vestel`] | TCP, unit 255 | A | 2002 (s, default 20 s), alive 6000 |
//! | [`generic`] | any | configured | configured |
//!
//! KEBA and Vestel read identification registers before probing; product
//! code and firmware decide which facets the unit gets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::bytes::{regs_to_ascii, RegisterFormat};
use crate::capability::{Capability, CapabilityProbe, Plausibility, Probe};
use crate::constants::{DEFAULT_MAX_CURRENT, DEFAULT_MIN_CURRENT, NOMINAL_VOLTAGE};
use crate::current::{CurrentEncoding, CurrentLimits};
use crate::drivers::register::{
    CurrentRegister, DiagnosticRegister, EnableMode, EnabledSource, FailsafeRegister, Field,
    IdEncoding, IdRegister, KeepAlive, KeepAliveValue, PhaseCoding, PhaseLayout, PhaseRegister,
    PhaseSwitch, PhaseTriple, PlugGate, PlugRule, PowerSource, Quantity, RegisterMap, Render,
    StatusRegister, TimeUnit, Variant, VariantRead, WakeUpSequence, WriteMode,
};
use crate::error::{ChargerError, ChargerResult};
use crate::status::{ChargeStatus, Iec61851Letter, LetterEncoding, StatusTable};
use crate::transport::RegisterKind;

use RegisterFormat::{I16, U16, U32};

// ============================================================================
// KEBA P30 / P40
// ============================================================================

pub const KEBA_UNIT_ID: u8 = 255;

/// KEBA KeContact P30 c/x-series and P40.
pub fn keba() -> RegisterMap {
    let status = StatusRegister {
        field: Field::holding(1000, U32),
        normalizer: Arc::new(StatusTable::new(
            "keba",
            &[
                (0, ChargeStatus::Unknown),
                (1, ChargeStatus::Connected),
                (2, ChargeStatus::Connected),
                (3, ChargeStatus::Charging),
                (4, ChargeStatus::Fault),
                (5, ChargeStatus::Connected),
            ],
        )),
    };
    let current = CurrentRegister {
        address: 5004,
        encoding: CurrentEncoding::MilliAmps,
        mode: WriteMode::Single,
    };

    RegisterMap {
        plug: Some(PlugGate {
            field: Field::holding(1004, U32),
            rule: PlugRule::Mask(1 << 2),
        }),
        enable: EnableMode::Register {
            address: 5014,
            on: 1,
            off: 0,
        },
        enabled_from: EnabledSource::StatusCodes(&[1, 5]),
        phases: Some(PhaseRegister {
            field: Field::holding(1552, U32),
            coding: PhaseCoding::Flag,
        }),
        phase_switch: Some(PhaseSwitch {
            address: 5052,
            coding: PhaseCoding::Flag,
            mode: WriteMode::Single,
        }),
        power: Some(PowerSource::Register(Quantity::new(
            Field::holding(1020, U32),
            1e-3,
        ))),
        energy: Some(Quantity::new(Field::holding(1036, U32), 1e-4)),
        currents: Some(PhaseTriple {
            kind: RegisterKind::Holding,
            base: 1008,
            stride: 2,
            format: U32,
            scale: 1e-3,
            blank: None,
            layout: PhaseLayout::PerPhase,
        }),
        voltages: Some(PhaseTriple {
            kind: RegisterKind::Holding,
            base: 1040,
            stride: 2,
            format: U32,
            scale: 1.0,
            blank: None,
            layout: PhaseLayout::PerPhase,
        }),
        identify: Some(IdRegister {
            kind: RegisterKind::Holding,
            address: 1500,
            count: 2,
            encoding: IdEncoding::Hex,
        }),
        diagnostics: vec![
            DiagnosticRegister::number("Serial", Field::holding(1014, U32), 1.0, ""),
            DiagnosticRegister::number("Product", Field::holding(1016, U32), 1.0, ""),
            DiagnosticRegister::number("Firmware", Field::holding(1018, U32), 1.0, ""),
            DiagnosticRegister::number("Phases source", Field::holding(1550, U32), 1.0, ""),
            DiagnosticRegister::number("Phases state", Field::holding(1552, U32), 1.0, ""),
            DiagnosticRegister::number("Failsafe timeout", Field::holding(1602, U32), 1.0, "s"),
        ],
        failsafe: Some(FailsafeRegister {
            field: Field::holding(1602, U32),
            unit: TimeUnit::Seconds,
        }),
        keep_alive: Some(KeepAlive {
            address: 5018,
            value: KeepAliveValue::TimeoutSeconds,
        }),
        variant: Some(Variant {
            reads: {
                const READS: &[VariantRead] = &[VariantRead::holding(1016, 2), VariantRead::holding(1018, 2)];
                READS
            },
            refine: keba_variant,
        }),
        probes: CapabilityProbe::new()
            .with_probe(Probe::holding(Capability::PhaseSwitch, 1550, 2).expect(Plausibility::EqualsU32(3)))
            .with_probe(Probe::holding(Capability::PhaseGet, 1550, 2).expect(Plausibility::EqualsU32(3)))
            .with_unconditional(Capability::Diagnose),
        ..RegisterMap::new("keba", status, current)
    }
}

/// Firmware 1.2.1 as reported in register 1018.
const KEBA_P40_ENERGY_FIX: u32 = 10201;

fn u32_at(values: &[Vec<u16>], index: usize) -> ChargerResult<u32> {
    match values.get(index).map(Vec::as_slice) {
        Some([hi, lo, ..]) => Ok(u32::from(*hi) << 16 | u32::from(*lo)),
        _ => Err(ChargerError::invalid_data("missing identification registers")),
    }
}

/// Product code 1016 selects the line and its options:
///
/// | Code | Line | Digit 5 | Digit 6 |
/// |------|------|---------|---------|
/// | `3xxxxx` | P30 | meter unless `0` | RFID if `1` |
/// | `4xxxxxx` | P40 | meter unless `0` | RFID if `1` |
///
/// P40 has no enable register; the current register doubles as enable.
/// P40 firmware before 1.2.1 reports energy in Wh instead of 0.1 Wh.
fn keba_variant(mut map: RegisterMap, values: &[Vec<u16>]) -> ChargerResult<RegisterMap> {
    let product = u32_at(values, 0)?;
    let firmware = u32_at(values, 1)?;

    let code = product.to_string();
    let digits = code.as_bytes();
    let p40 = match (digits.len(), digits[0]) {
        (6, b'3') => false,
        (7, b'4') => true,
        _ => {
            warn!(product, "unknown keba product code, optional facets disabled");
            return Ok(map);
        }
    };

    if p40 {
        map.enable = EnableMode::Shared { sentinel: 0 };
        map.enabled_from = EnabledSource::CurrentRegister;
        if firmware < KEBA_P40_ENERGY_FIX {
            map.energy = Some(Quantity::new(Field::holding(1036, U32), 1e-3));
        }
    }

    if digits[4] != b'0' {
        map.probes = map
            .probes
            .with_unconditional(Capability::Meter)
            .with_unconditional(Capability::MeterEnergy)
            .with_unconditional(Capability::PhaseCurrents)
            .with_probe(Probe::holding(Capability::PhaseVoltages, 1040, 2));
    }
    if digits[5] == b'1' {
        map.probes = map.probes.with_unconditional(Capability::Identify);
    }

    debug!(product, firmware, p40, "keba variant");
    Ok(map)
}

// ============================================================================
// Amperfied / Heidelberg Energy Control
// ============================================================================

pub const AMPERFIED_UNIT_ID: u8 = 255;

/// Amperfied Wallbox (Heidelberg Energy Control). Phase switching requires
/// the separately installed 1p/3p contactor and is only mapped when
/// `phase_switching` is set.
pub fn amperfied(phase_switching: bool) -> RegisterMap {
    let status = StatusRegister {
        field: Field::input(5, U16),
        normalizer: Arc::new(StatusTable::new(
            "amperfied",
            &[
                (2, ChargeStatus::NoVehicle),
                (3, ChargeStatus::NoVehicle),
                (4, ChargeStatus::Connected),
                (5, ChargeStatus::Connected),
                (6, ChargeStatus::Charging),
                (7, ChargeStatus::Charging),
                (10, ChargeStatus::Locked),
            ],
        )),
    };
    let current = CurrentRegister {
        address: 261,
        encoding: CurrentEncoding::DeciAmps,
        mode: WriteMode::Multiple,
    };

    let mut probes = CapabilityProbe::new()
        .with_probe(Probe::input(Capability::Meter, 14, 1).expect(Plausibility::NotAllOnes))
        .with_probe(Probe::input(Capability::MeterEnergy, 17, 2).expect(Plausibility::NotAllOnes))
        .with_probe(Probe::input(Capability::PhaseCurrents, 6, 3).expect(Plausibility::NotAllOnes))
        .with_probe(Probe::input(Capability::PhaseVoltages, 10, 3))
        .with_probe(Probe::input(Capability::Identify, 2002, 6).expect(Plausibility::NotAllOnes))
        .with_unconditional(Capability::WakeUp)
        .with_unconditional(Capability::Diagnose);

    let (phases, phase_switch) = if phase_switching {
        probes = probes
            .with_probe(Probe::input(Capability::PhaseSwitch, 5001, 1).expect(Plausibility::NotAllOnes))
            .with_probe(Probe::input(Capability::PhaseGet, 5001, 1).expect(Plausibility::NotAllOnes));
        (
            Some(PhaseRegister {
                field: Field::input(5001, U16),
                coding: PhaseCoding::Count,
            }),
            Some(PhaseSwitch {
                address: 501,
                coding: PhaseCoding::Count,
                mode: WriteMode::Multiple,
            }),
        )
    } else {
        (None, None)
    };

    RegisterMap {
        limits: CurrentLimits::new().with_max(16.0),
        phases,
        phase_switch,
        power: Some(PowerSource::Register(Quantity::new(Field::input(14, U16), 1.0))),
        energy: Some(Quantity::new(Field::input(17, U32), 1e-3)),
        currents: Some(PhaseTriple {
            kind: RegisterKind::Input,
            base: 6,
            stride: 1,
            format: U16,
            scale: 0.1,
            blank: None,
            layout: PhaseLayout::Block,
        }),
        voltages: Some(PhaseTriple {
            kind: RegisterKind::Input,
            base: 10,
            stride: 1,
            format: U16,
            scale: 1.0,
            blank: None,
            layout: PhaseLayout::Block,
        }),
        identify: Some(IdRegister {
            kind: RegisterKind::Input,
            address: 2002,
            count: 6,
            encoding: IdEncoding::Hex,
        }),
        wake_up: Some(WakeUpSequence {
            address: 259,
            release: 0,
            engage: 1,
        }),
        diagnostics: vec![
            DiagnosticRegister::number("Temperature", Field::input(9, I16), 0.1, "C"),
            DiagnosticRegister::number("Timeout", Field::holding(257, U16), 1.0, "ms"),
            DiagnosticRegister::number("Remote lock", Field::holding(259, U16), 1.0, ""),
            DiagnosticRegister::number("Failsafe current", Field::holding(262, U16), 0.1, "A"),
        ],
        failsafe: Some(FailsafeRegister {
            field: Field::holding(257, U16),
            unit: TimeUnit::Millis,
        }),
        probes,
        ..RegisterMap::new("amperfied", status, current)
    }
}

// ============================================================================
// ABL eMH1
// ============================================================================

pub const ABL_UNIT_ID: u8 = 1;

/// Raw value ABL uses for "no current offered" and for an idle phase.
pub const ABL_DISABLED: u16 = 0x03E8;

/// ABL eMH1 over Modbus ASCII.
pub fn abl() -> RegisterMap {
    let status = StatusRegister {
        field: Field::holding(0x04, U16),
        normalizer: Arc::new(Iec61851Letter::new(LetterEncoding::Nibble)),
    };
    let current = CurrentRegister {
        address: 0x14,
        encoding: CurrentEncoding::DutyCycle,
        mode: WriteMode::Single,
    };

    RegisterMap {
        enable: EnableMode::Shared {
            sentinel: ABL_DISABLED,
        },
        power: Some(PowerSource::FromCurrents {
            voltage: NOMINAL_VOLTAGE,
        }),
        currents: Some(PhaseTriple {
            kind: RegisterKind::Holding,
            base: 0x30,
            stride: 1,
            format: U16,
            scale: 0.1,
            blank: Some(ABL_DISABLED),
            layout: PhaseLayout::Block,
        }),
        diagnostics: vec![DiagnosticRegister {
            label: "Firmware",
            kind: RegisterKind::Holding,
            address: 0x01,
            count: 2,
            render: Render::Hex,
        }],
        probes: CapabilityProbe::new()
            .with_unconditional(Capability::Meter)
            .with_unconditional(Capability::PhaseCurrents)
            .with_unconditional(Capability::Diagnose),
        ..RegisterMap::new("abl", status, current)
    }
}

// ============================================================================
// Vestel EVC04
// ============================================================================

pub const VESTEL_UNIT_ID: u8 = 255;

/// Vestel EVC04 (also sold as Hymes, Webasto Unite).
pub fn vestel() -> RegisterMap {
    let status = StatusRegister {
        field: Field::input(1001, U16),
        normalizer: Arc::new(StatusTable::new(
            "vestel",
            &[(0, ChargeStatus::Connected), (1, ChargeStatus::Charging)],
        )),
    };
    let current = CurrentRegister {
        address: 5004,
        encoding: CurrentEncoding::Amps,
        mode: WriteMode::Single,
    };
    let three_phase = |capability| {
        Probe::input(capability, 404, 1).expect(Plausibility::Equals(1))
    };

    RegisterMap {
        plug: Some(PlugGate {
            field: Field::input(1004, U16),
            rule: PlugRule::AtLeast(2),
        }),
        enabled_from: EnabledSource::Memory,
        phases: Some(PhaseRegister {
            field: Field::holding(405, U16),
            coding: PhaseCoding::Flag,
        }),
        phase_switch: Some(PhaseSwitch {
            address: 405,
            coding: PhaseCoding::Flag,
            mode: WriteMode::Single,
        }),
        power: Some(PowerSource::Register(Quantity::new(Field::input(1020, U32), 1.0))),
        energy: Some(Quantity::new(Field::input(1036, U32), 0.1)),
        currents: Some(PhaseTriple {
            kind: RegisterKind::Input,
            base: 1008,
            stride: 2,
            format: U16,
            scale: 1e-3,
            blank: None,
            layout: PhaseLayout::PerPhase,
        }),
        voltages: Some(PhaseTriple {
            kind: RegisterKind::Input,
            base: 1014,
            stride: 2,
            format: U16,
            scale: 1.0,
            blank: None,
            layout: PhaseLayout::PerPhase,
        }),
        identify: Some(IdRegister {
            kind: RegisterKind::Input,
            address: 1516,
            count: 15,
            encoding: IdEncoding::Ascii,
        }),
        diagnostics: vec![
            DiagnosticRegister::text("Brand", RegisterKind::Input, 190, 10),
            DiagnosticRegister::text("Model", RegisterKind::Input, 210, 5),
            DiagnosticRegister::text("Serial", RegisterKind::Input, 100, 25),
            DiagnosticRegister::text("Firmware", RegisterKind::Input, 230, 50),
            DiagnosticRegister::number("Failsafe timeout", Field::holding(2002, U16), 1.0, "s"),
            DiagnosticRegister::number("Number of phases", Field::input(404, U16), 1.0, ""),
        ],
        failsafe: Some(FailsafeRegister {
            field: Field::holding(2002, U16),
            unit: TimeUnit::Seconds,
        }),
        default_watchdog: Some(Duration::from_secs(20)),
        keep_alive: Some(KeepAlive {
            address: 6000,
            value: KeepAliveValue::Fixed(1),
        }),
        variant: Some(Variant {
            reads: {
                const READS: &[VariantRead] = &[VariantRead::input(230, 50)];
                READS
            },
            refine: vestel_variant,
        }),
        probes: CapabilityProbe::new()
            .with_probe(Probe::input(Capability::Meter, 1020, 2).expect(Plausibility::NotAllOnes))
            .with_probe(Probe::input(Capability::MeterEnergy, 1036, 2).expect(Plausibility::NotAllOnes))
            .with_probe(Probe::input(Capability::PhaseCurrents, 1008, 1).expect(Plausibility::NotAllOnes))
            .with_probe(Probe::input(Capability::PhaseVoltages, 1014, 1))
            .with_probe(three_phase(Capability::PhaseSwitch))
            .with_probe(three_phase(Capability::PhaseGet))
            .with_unconditional(Capability::Diagnose),
        ..RegisterMap::new("vestel", status, current)
    }
}

/// First firmware with a readable RFID register.
const VESTEL_RFID_FIRMWARE: (u32, u32, u32) = (3, 156, 0);

/// `major.minor.patch`, optional `v` prefix, pre-release suffix ignored.
fn parse_firmware(text: &str) -> Option<(u32, u32, u32)> {
    let mut parts = text.trim().trim_start_matches('v').splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = match parts.next() {
        Some(rest) => {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()?
        }
        None => 0,
    };
    Some((major, minor, patch))
}

fn vestel_variant(mut map: RegisterMap, values: &[Vec<u16>]) -> ChargerResult<RegisterMap> {
    let firmware = values.first().map(|regs| regs_to_ascii(regs)).unwrap_or_default();

    match parse_firmware(&firmware) {
        Some(version) if version >= VESTEL_RFID_FIRMWARE => {
            map.probes = map.probes.with_unconditional(Capability::Identify);
        }
        Some(_) => debug!(firmware = %firmware, "vestel firmware without rfid"),
        None => warn!(firmware = %firmware, "unparseable vestel firmware, identification disabled"),
    }

    Ok(map)
}

// ============================================================================
// Generic, fully configured
// ============================================================================

fn default_scale() -> f64 {
    1.0
}

fn default_on() -> u16 {
    1
}

fn default_format() -> RegisterFormat {
    RegisterFormat::U16
}

/// A scaled register reading.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantitySettings {
    pub register: u16,
    #[serde(default)]
    pub input: bool,
    #[serde(default = "default_format")]
    pub format: RegisterFormat,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl QuantitySettings {
    fn field(&self) -> Field {
        if self.input {
            Field::input(self.register, self.format)
        } else {
            Field::holding(self.register, self.format)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusSettings {
    pub register: u16,
    #[serde(default)]
    pub input: bool,
    #[serde(default = "default_format")]
    pub format: RegisterFormat,
    /// Documented vendor codes.
    pub codes: BTreeMap<u32, ChargeStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentSettings {
    pub register: u16,
    pub encoding: CurrentEncoding,
    #[serde(default)]
    pub mode: WriteMode,
    /// Disable sentinel when the current register doubles as enable.
    #[serde(default)]
    pub sentinel: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnableSettings {
    pub register: u16,
    #[serde(default = "default_on")]
    pub on: u16,
    #[serde(default)]
    pub off: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailsafeSettings {
    pub register: u16,
    #[serde(default)]
    pub input: bool,
    #[serde(default = "default_format")]
    pub format: RegisterFormat,
    pub unit: TimeUnit,
}

/// Register map of a unit without a built-in profile.
///
/// ```json
/// {
///   "status": { "register": 100, "input": true, "codes": { "1": "no_vehicle", "2": "connected", "3": "charging" } },
///   "current": { "register": 300, "encoding": "deci_amps" },
///   "failsafe": { "register": 301, "unit": "seconds" }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GenericSettings {
    pub status: StatusSettings,
    pub current: CurrentSettings,
    #[serde(default)]
    pub enable: Option<EnableSettings>,
    #[serde(default)]
    pub failsafe: Option<FailsafeSettings>,
    #[serde(default)]
    pub power: Option<QuantitySettings>,
    #[serde(default)]
    pub energy: Option<QuantitySettings>,
    #[serde(default)]
    pub min_current: Option<f64>,
    #[serde(default)]
    pub max_current: Option<f64>,
}

/// Build a register map from configuration.
pub fn generic(settings: &GenericSettings) -> ChargerResult<RegisterMap> {
    if settings.status.codes.is_empty() {
        return Err(ChargerError::configuration("status code table is empty"));
    }

    let limits = CurrentLimits::new()
        .with_min(settings.min_current.unwrap_or(DEFAULT_MIN_CURRENT))
        .with_max(settings.max_current.unwrap_or(DEFAULT_MAX_CURRENT));
    if limits.min <= 0.0 || limits.min > limits.max {
        return Err(ChargerError::configuration(format!(
            "invalid current range {}..{}A",
            limits.min, limits.max
        )));
    }

    let codes: Vec<(u32, ChargeStatus)> = settings
        .status
        .codes
        .iter()
        .map(|(&code, &status)| (code, status))
        .collect();
    let status_field = if settings.status.input {
        Field::input(settings.status.register, settings.status.format)
    } else {
        Field::holding(settings.status.register, settings.status.format)
    };

    let status = StatusRegister {
        field: status_field,
        normalizer: Arc::new(StatusTable::new("modbus", &codes)),
    };
    let current = CurrentRegister {
        address: settings.current.register,
        encoding: settings.current.encoding,
        mode: settings.current.mode,
    };
    if current.encoding.needs_phases() {
        return Err(ChargerError::configuration(
            "power-encoded setpoints need a vendor profile with a phase register",
        ));
    }

    let mut map = RegisterMap::new("modbus", status, current);
    map.limits = limits;

    match &settings.enable {
        Some(enable) => {
            map.enable = EnableMode::Register {
                address: enable.register,
                on: enable.on,
                off: enable.off,
            };
            map.enabled_from = EnabledSource::Memory;
        }
        None => {
            map.enable = EnableMode::Shared {
                sentinel: settings.current.sentinel,
            };
        }
    }

    if let Some(failsafe) = &settings.failsafe {
        let field = if failsafe.input {
            Field::input(failsafe.register, failsafe.format)
        } else {
            Field::holding(failsafe.register, failsafe.format)
        };
        map.failsafe = Some(FailsafeRegister {
            field,
            unit: failsafe.unit,
        });
    }

    let mut probes = CapabilityProbe::new();
    if let Some(power) = &settings.power {
        let field = power.field();
        map.power = Some(PowerSource::Register(Quantity::new(field, power.scale)));
        probes = probes.with_probe(probe_for(Capability::Meter, field));
    }
    if let Some(energy) = &settings.energy {
        let field = energy.field();
        map.energy = Some(Quantity::new(field, energy.scale));
        probes = probes.with_probe(probe_for(Capability::MeterEnergy, field));
    }
    map.probes = probes;

    Ok(map)
}

fn probe_for(capability: Capability, field: Field) -> Probe {
    let probe = match field.kind {
        RegisterKind::Holding => Probe::holding(capability, field.address, field.format.register_count()),
        RegisterKind::Input => Probe::input(capability, field.address, field.format.register_count()),
    };
    probe.expect(Plausibility::NotAllOnes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusNormalizer;
    use serde_json::json;

    #[test]
    fn test_keba_status_codes() {
        let map = keba();
        let n = &map.status.normalizer;
        assert_eq!(n.normalize(3).unwrap(), ChargeStatus::Charging);
        assert_eq!(n.normalize(4).unwrap(), ChargeStatus::Fault);
        assert!(n.normalize(6).is_err());
    }

    fn word(value: u32) -> Vec<u16> {
        vec![(value >> 16) as u16, value as u16]
    }

    fn checks_for(map: &RegisterMap, capability: Capability) -> bool {
        map.probes.probes().iter().any(|p| p.capability == capability)
    }

    #[test]
    fn test_keba_product_code_gates_facets() {
        let bare = keba_variant(keba(), &[word(311000), word(10300)]).unwrap();
        let fixed = bare.probes.unconditional();
        assert!(!fixed.contains(Capability::Identify));
        assert!(!fixed.contains(Capability::Meter));
        assert!(!checks_for(&bare, Capability::PhaseVoltages));
        assert!(matches!(bare.enable, EnableMode::Register { address: 5014, .. }));

        let full = keba_variant(keba(), &[word(311011), word(10300)]).unwrap();
        let fixed = full.probes.unconditional();
        assert!(fixed.contains(Capability::Identify));
        assert!(fixed.contains(Capability::Meter));
        assert!(fixed.contains(Capability::MeterEnergy));
        assert!(fixed.contains(Capability::PhaseCurrents));
        assert!(checks_for(&full, Capability::PhaseVoltages));

        // unknown product line: mandatory surface only
        let unknown = keba_variant(keba(), &[word(0), word(0)]).unwrap();
        assert!(unknown.probes.unconditional().iter().all(|c| c == Capability::Diagnose));
    }

    #[test]
    fn test_keba_p40_uses_current_register_as_enable() {
        let old = keba_variant(keba(), &[word(4110110), word(10200)]).unwrap();
        assert_eq!(old.enable, EnableMode::Shared { sentinel: 0 });
        assert_eq!(old.enabled_from, EnabledSource::CurrentRegister);
        assert_eq!(old.energy.map(|q| q.scale), Some(1e-3));

        let fixed = keba_variant(keba(), &[word(4110110), word(10201)]).unwrap();
        assert_eq!(fixed.energy.map(|q| q.scale), Some(1e-4));
        assert!(fixed.probes.unconditional().contains(Capability::Meter));
    }

    #[test]
    fn test_keba_variant_needs_both_words() {
        assert!(keba_variant(keba(), &[word(311011)]).is_err());
        assert!(keba_variant(keba(), &[vec![1], word(0)]).is_err());
    }

    #[test]
    fn test_firmware_versions() {
        assert_eq!(parse_firmware("v3.156.0"), Some((3, 156, 0)));
        assert_eq!(parse_firmware("3.187.2-rc1"), Some((3, 187, 2)));
        assert_eq!(parse_firmware("4.1"), Some((4, 1, 0)));
        assert_eq!(parse_firmware(""), None);
        assert_eq!(parse_firmware("EVC04"), None);
        assert!(parse_firmware("v3.155.9").unwrap() < VESTEL_RFID_FIRMWARE);
    }

    #[test]
    fn test_vestel_firmware_gates_identify() {
        let ascii = |text: &str| -> Vec<u16> {
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(100, 0);
            bytes.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
        };

        let old = vestel_variant(vestel(), &[ascii("v3.155.0")]).unwrap();
        assert!(!old.probes.unconditional().contains(Capability::Identify));

        let new = vestel_variant(vestel(), &[ascii("v3.156.0")]).unwrap();
        assert!(new.probes.unconditional().contains(Capability::Identify));

        let blank = vestel_variant(vestel(), &[vec![0; 50]]).unwrap();
        assert!(!blank.probes.unconditional().contains(Capability::Identify));
    }

    #[test]
    fn test_amperfied_status_codes() {
        let map = amperfied(false);
        let n = &map.status.normalizer;
        assert_eq!(n.normalize(2).unwrap(), ChargeStatus::NoVehicle);
        assert_eq!(n.normalize(5).unwrap(), ChargeStatus::Connected);
        assert_eq!(n.normalize(7).unwrap(), ChargeStatus::Charging);
        assert_eq!(n.normalize(10).unwrap(), ChargeStatus::Locked);
        for code in [0, 1, 8, 9, 11] {
            assert!(n.normalize(code).is_err());
        }
        assert!(map.phase_switch.is_none());
        assert!(amperfied(true).phase_switch.is_some());
    }

    #[test]
    fn test_abl_letters() {
        let map = abl();
        assert_eq!(map.status.normalizer.normalize(0xB1).unwrap(), ChargeStatus::Connected);
        assert_eq!(map.status.normalizer.normalize(0xC2).unwrap(), ChargeStatus::Charging);
        assert_eq!(map.enable, EnableMode::Shared { sentinel: ABL_DISABLED });
    }

    #[test]
    fn test_generic_from_json() {
        let settings: GenericSettings = serde_json::from_value(json!({
            "status": {
                "register": 100,
                "input": true,
                "codes": { "1": "no_vehicle", "2": "connected", "3": "charging" }
            },
            "current": { "register": 300, "encoding": "deci_amps", "mode": "multiple" },
            "failsafe": { "register": 301, "unit": "seconds" },
            "energy": { "register": 200, "format": "u32", "scale": 0.001 },
            "max_current": 16
        }))
        .unwrap();

        let map = generic(&settings).unwrap();
        assert_eq!(map.status.normalizer.normalize(2).unwrap(), ChargeStatus::Connected);
        assert!(map.status.normalizer.normalize(4).is_err());
        assert_eq!(map.current.encoding, CurrentEncoding::DeciAmps);
        assert_eq!(map.current.mode, WriteMode::Multiple);
        assert_eq!(map.limits.max, 16.0);
        assert!(map.failsafe.is_some());
        assert!(map.energy.is_some());
        assert_eq!(map.probes.probes().len(), 1);
    }

    #[test]
    fn test_generic_rejects_bad_settings() {
        let settings: GenericSettings = serde_json::from_value(json!({
            "status": { "register": 100, "codes": {} },
            "current": { "register": 300, "encoding": "amps" }
        }))
        .unwrap();
        assert!(generic(&settings).is_err());

        let settings: GenericSettings = serde_json::from_value(json!({
            "status": { "register": 100, "codes": { "1": "charging" } },
            "current": { "register": 300, "encoding": "amps" },
            "min_current": 20,
            "max_current": 16
        }))
        .unwrap();
        assert!(matches!(
            generic(&settings),
            Err(ChargerError::Configuration { .. })
        ));
    }
}
