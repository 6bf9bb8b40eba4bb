//! Canonical charge status and vendor code normalization
//!
//! Every vendor reports vehicle state differently: numeric state machines,
//! cable-state bitfields, ASCII IEC 61851 letters. Drivers translate those
//! into [`ChargeStatus`] through a [`StatusNormalizer`].
//!
//! A normalizer is total on the vendor's documented codes and fails on
//! everything else. It never falls back to a plausible default: reporting
//! "no vehicle" for an unmapped fault code is a safety defect.
//!
//! ```rust
//! use voltage_evse::{ChargeStatus, StatusNormalizer, StatusTable};
//!
//! let table = StatusTable::new(
//!     "example",
//!     &[(1, ChargeStatus::NoVehicle), (2, ChargeStatus::Connected), (3, ChargeStatus::Charging)],
//! );
//!
//! assert_eq!(table.normalize(3).unwrap(), ChargeStatus::Charging);
//! assert!(table.normalize(9).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::error::{ChargerError, ChargerResult};

/// Canonical vehicle/charger state, following IEC 61851 states A-F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// State A: no vehicle connected.
    NoVehicle,
    /// State B: vehicle connected, not drawing power.
    Connected,
    /// State C: charging.
    Charging,
    /// State D: charging with ventilation required.
    ChargingVentilated,
    /// State E: fault, no power offered.
    Fault,
    /// State F: unit locked or unavailable.
    Locked,
    /// Unit documents the code as indeterminate (e.g. start-up).
    Unknown,
}

impl ChargeStatus {
    /// IEC 61851 state letter, if the status has one.
    pub fn iec61851(&self) -> Option<char> {
        match self {
            Self::NoVehicle => Some('A'),
            Self::Connected => Some('B'),
            Self::Charging => Some('C'),
            Self::ChargingVentilated => Some('D'),
            Self::Fault => Some('E'),
            Self::Locked => Some('F'),
            Self::Unknown => None,
        }
    }

    pub fn from_iec61851(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'A' => Some(Self::NoVehicle),
            'B' => Some(Self::Connected),
            'C' => Some(Self::Charging),
            'D' => Some(Self::ChargingVentilated),
            'E' => Some(Self::Fault),
            'F' => Some(Self::Locked),
            _ => None,
        }
    }

    #[inline]
    pub fn is_charging(&self) -> bool {
        matches!(self, Self::Charging | Self::ChargingVentilated)
    }

    /// Vehicle is plugged in, charging or not.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Charging | Self::ChargingVentilated
        )
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iec61851() {
            Some(letter) => write!(f, "{}", letter),
            None => f.write_str("unknown"),
        }
    }
}

/// Maps a raw vendor status value to [`ChargeStatus`].
pub trait StatusNormalizer: Send + Sync {
    /// Normalize `raw`, failing with [`ChargerError::UnknownStatus`] on any
    /// undocumented value.
    fn normalize(&self, raw: u32) -> ChargerResult<ChargeStatus>;
}

/// Lookup table from documented vendor codes to canonical states.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTable {
    vendor: String,
    entries: BTreeMap<u32, ChargeStatus>,
}

impl StatusTable {
    /// Build a table. When a code appears twice the first entry wins.
    pub fn new<S: Into<String>>(vendor: S, entries: &[(u32, ChargeStatus)]) -> Self {
        let mut map = BTreeMap::new();
        for &(code, status) in entries {
            map.entry(code).or_insert(status);
        }

        Self {
            vendor: vendor.into(),
            entries: map,
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Documented codes in ascending order.
    pub fn codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }
}

impl StatusNormalizer for StatusTable {
    fn normalize(&self, raw: u32) -> ChargerResult<ChargeStatus> {
        self.entries
            .get(&raw)
            .copied()
            .ok_or_else(|| ChargerError::unknown_status(raw, format!("{} status", self.vendor)))
    }
}

/// How an IEC 61851 letter is carried in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterEncoding {
    /// Low byte holds the ASCII letter ('A' = 0x41).
    Ascii,
    /// High nibble of the low byte holds 0xA..0xF for states A..F
    /// (e.g. 0xB1 is state B1).
    Nibble,
}

/// Normalizer for units that report the IEC 61851 state letter directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iec61851Letter {
    encoding: LetterEncoding,
}

impl Iec61851Letter {
    pub const fn new(encoding: LetterEncoding) -> Self {
        Self { encoding }
    }
}

impl StatusNormalizer for Iec61851Letter {
    fn normalize(&self, raw: u32) -> ChargerResult<ChargeStatus> {
        let letter = match self.encoding {
            LetterEncoding::Ascii => char::from((raw & 0xFF) as u8),
            LetterEncoding::Nibble => {
                let nibble = ((raw >> 4) & 0x0F) as u8;
                if nibble < 0x0A {
                    return Err(ChargerError::unknown_status(raw, "IEC 61851 state"));
                }
                char::from(b'A' + (nibble - 0x0A))
            }
        };

        ChargeStatus::from_iec61851(letter)
            .ok_or_else(|| ChargerError::unknown_status(raw, "IEC 61851 state"))
    }
}
