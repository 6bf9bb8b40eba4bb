//! # Register Decoding
//!
//! Charge point register maps mix 16-bit and 32-bit quantities, signed
//! temperatures, IEEE 754 floats, hex-encoded RFID tags and ASCII firmware
//! strings. This module turns raw holding/input register words into those
//! values.
//!
//! ## Word order
//!
//! Uses ABCD notation where A is the most significant byte. For the 32-bit
//! value `0x12345678`:
//! - `BigEndian (ABCD)`: registers \[0x1234, 0x5678\]
//! - `BigEndianSwap (CDAB)`: registers \[0x5678, 0x1234\]
//! - `LittleEndian (DCBA)`: registers \[0x7856, 0x3412\]
//! - `LittleEndianSwap (BADC)`: registers \[0x3412, 0x7856\]

use std::fmt;

use serde::{Deserialize, Deserializer};

use crate::error::{ChargerError, ChargerResult};

/// Byte/word order of multi-register values.
///
/// # Example
///
/// ```rust
/// use voltage_evse::ByteOrder;
///
/// let order = ByteOrder::from_str("CDAB").unwrap();
/// assert_eq!(order, ByteOrder::BigEndianSwap);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD, network byte order.
    #[default]
    BigEndian,
    /// DCBA.
    LittleEndian,
    /// CDAB, big-endian words in swapped order.
    BigEndianSwap,
    /// BADC.
    LittleEndianSwap,
}

impl ByteOrder {
    /// Parse the common textual spellings ("ABCD", "cd-ab", "LE", ...).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "BE" | "BIGENDIAN" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLEENDIAN" => Some(Self::LittleEndian),
            "CDAB" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ByteOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown byte order: {}", s)))
    }
}

/// Convert 2 registers to 4 big-endian bytes according to `order`.
#[inline]
pub fn regs_to_bytes_4(regs: [u16; 2], order: ByteOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];

    match order {
        ByteOrder::BigEndian => [h0[0], h0[1], h1[0], h1[1]],
        ByteOrder::LittleEndian => [h1[1], h1[0], h0[1], h0[0]],
        ByteOrder::BigEndianSwap => [h1[0], h1[1], h0[0], h0[1]],
        ByteOrder::LittleEndianSwap => [h0[1], h0[0], h1[1], h1[0]],
    }
}

/// Split a 32-bit value into 2 registers according to `order`.
#[inline]
pub fn u32_to_regs(value: u32, order: ByteOrder) -> [u16; 2] {
    let b = value.to_be_bytes();
    match order {
        ByteOrder::BigEndian => [u16::from_be_bytes([b[0], b[1]]), u16::from_be_bytes([b[2], b[3]])],
        ByteOrder::LittleEndian => [u16::from_be_bytes([b[3], b[2]]), u16::from_be_bytes([b[1], b[0]])],
        ByteOrder::BigEndianSwap => [u16::from_be_bytes([b[2], b[3]]), u16::from_be_bytes([b[0], b[1]])],
        ByteOrder::LittleEndianSwap => [u16::from_be_bytes([b[1], b[0]]), u16::from_be_bytes([b[3], b[2]])],
    }
}

#[inline]
pub fn regs_to_u32(regs: [u16; 2], order: ByteOrder) -> u32 {
    u32::from_be_bytes(regs_to_bytes_4(regs, order))
}

#[inline]
pub fn regs_to_i32(regs: [u16; 2], order: ByteOrder) -> i32 {
    i32::from_be_bytes(regs_to_bytes_4(regs, order))
}

#[inline]
pub fn regs_to_f32(regs: [u16; 2], order: ByteOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(regs, order))
}

/// Numeric layout of a register-mapped quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl RegisterFormat {
    /// Number of 16-bit registers occupied by one value.
    pub fn register_count(&self) -> u16 {
        match self {
            Self::U16 | Self::I16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
        }
    }

    /// Decode the leading value of `regs` as `f64`.
    pub fn decode(&self, regs: &[u16], order: ByteOrder) -> ChargerResult<f64> {
        let needed = self.register_count() as usize;
        if regs.len() < needed {
            return Err(ChargerError::invalid_data(format!(
                "{:?} needs {} registers, got {}",
                self,
                needed,
                regs.len()
            )));
        }

        let value = match self {
            Self::U16 => f64::from(regs[0]),
            Self::I16 => f64::from(regs[0] as i16),
            Self::U32 => f64::from(regs_to_u32([regs[0], regs[1]], order)),
            Self::I32 => f64::from(regs_to_i32([regs[0], regs[1]], order)),
            Self::F32 => f64::from(regs_to_f32([regs[0], regs[1]], order)),
        };

        Ok(value)
    }
}

/// True when a register block carries no information: all-zero or all-ones.
///
/// Units without a fitted meter or reader typically answer with one of
/// these patterns instead of an exception.
pub fn is_null_sentinel(regs: &[u16]) -> bool {
    !regs.is_empty() && (regs.iter().all(|&r| r == 0) || regs.iter().all(|&r| r == 0xFFFF))
}

/// Hex-encode registers, most significant byte first (RFID tags).
pub fn regs_to_hex(regs: &[u16]) -> String {
    regs.iter().map(|r| format!("{:04x}", r)).collect()
}

/// Decode registers holding two ASCII characters each, stopping at NUL.
pub fn regs_to_ascii(regs: &[u16]) -> String {
    regs.iter()
        .flat_map(|r| r.to_be_bytes())
        .take_while(|&b| b != 0)
        .map(char::from)
        .collect::<String>()
        .trim()
        .to_string()
}
