//! # Capability Probing
//!
//! Which optional facets a physical unit supports is decided once, at
//! construction, by speculative reads. A facet is present only when every
//! probe registered for it read successfully *and* returned a plausible
//! value.
//!
//! | Probe outcome | Facet |
//! |---------------|-------|
//! | read ok, plausible | present |
//! | read ok, null sentinel (all-zero / all-ones) | absent |
//! | transport error / timeout | absent |
//!
//! Probing is best effort. It never fails construction of the charge point;
//! only the mandatory control surface is required for that.

use std::fmt;

use tracing::debug;

use crate::bytes::is_null_sentinel;
use crate::transport::{Connection, RegisterKind, RegisterTransport};

/// Optional facet of a charge point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Meter,
    MeterEnergy,
    PhaseCurrents,
    PhaseVoltages,
    PhaseSwitch,
    PhaseGet,
    Identify,
    Diagnose,
    WakeUp,
}

impl Capability {
    /// Every facet, in bit order.
    pub const ALL: [Capability; 9] = [
        Capability::Meter,
        Capability::MeterEnergy,
        Capability::PhaseCurrents,
        Capability::PhaseVoltages,
        Capability::PhaseSwitch,
        Capability::PhaseGet,
        Capability::Identify,
        Capability::Diagnose,
        Capability::WakeUp,
    ];

    #[inline]
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::MeterEnergy => "meter energy",
            Self::PhaseCurrents => "phase currents",
            Self::PhaseVoltages => "phase voltages",
            Self::PhaseSwitch => "phase switch",
            Self::PhaseGet => "phase get",
            Self::Identify => "identify",
            Self::Diagnose => "diagnose",
            Self::WakeUp => "wake-up",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of facets, fixed once a charge point is composed.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn remove(&mut self, capability: Capability) {
        self.0 &= !capability.bit();
    }

    #[inline]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Facets present in both sets.
    pub fn intersection(&self, other: CapabilitySet) -> CapabilitySet {
        Self(self.0 & other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// What a probe read must look like for the facet to count as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plausibility {
    /// Any successful read.
    Any,
    /// Not all-zero and not all-ones.
    NotNull,
    /// Not all-ones; zero is a legitimate reading (e.g. an idle meter).
    NotAllOnes,
    /// First register equals the given value.
    Equals(u16),
    /// Leading 32-bit big-endian word equals the given value.
    EqualsU32(u32),
}

impl Plausibility {
    pub fn accepts(&self, regs: &[u16]) -> bool {
        match self {
            Self::Any => true,
            Self::NotNull => !is_null_sentinel(regs),
            Self::NotAllOnes => !regs.is_empty() && !regs.iter().all(|&r| r == 0xFFFF),
            Self::Equals(value) => regs.first() == Some(value),
            Self::EqualsU32(value) => match regs {
                [hi, lo, ..] => (u32::from(*hi) << 16 | u32::from(*lo)) == *value,
                _ => false,
            },
        }
    }
}

/// One speculative read deciding (part of) a facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub capability: Capability,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
    pub plausibility: Plausibility,
}

impl Probe {
    pub const fn holding(capability: Capability, address: u16, count: u16) -> Self {
        Self {
            capability,
            kind: RegisterKind::Holding,
            address,
            count,
            plausibility: Plausibility::NotNull,
        }
    }

    pub const fn input(capability: Capability, address: u16, count: u16) -> Self {
        Self {
            capability,
            kind: RegisterKind::Input,
            address,
            count,
            plausibility: Plausibility::NotNull,
        }
    }

    pub const fn expect(mut self, plausibility: Plausibility) -> Self {
        self.plausibility = plausibility;
        self
    }
}

/// Runs a set of probes against one unit.
#[derive(Debug, Clone, Default)]
pub struct CapabilityProbe {
    probes: Vec<Probe>,
    unconditional: CapabilitySet,
}

impl CapabilityProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probes.push(probe);
        self
    }

    /// Facet present on every unit of the profile, no read needed.
    pub fn with_unconditional(mut self, capability: Capability) -> Self {
        self.unconditional.insert(capability);
        self
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn unconditional(&self) -> CapabilitySet {
        self.unconditional
    }

    /// Run every probe once, each in its own transaction.
    ///
    /// A facet is present when all its probes pass. Errors only disable the
    /// facet they belong to.
    pub async fn run<T: RegisterTransport>(&self, conn: &Connection<T>) -> CapabilitySet {
        let mut passed = self.unconditional;
        let mut failed = CapabilitySet::empty();

        for probe in &self.probes {
            let result = conn
                .transaction()
                .await
                .read(probe.kind, probe.address, probe.count)
                .await;

            match result {
                Ok(regs) if probe.plausibility.accepts(&regs) => {
                    debug!(
                        charger = %conn.name(),
                        capability = %probe.capability,
                        address = probe.address,
                        "probe passed"
                    );
                    passed.insert(probe.capability);
                }
                Ok(regs) => {
                    debug!(
                        charger = %conn.name(),
                        capability = %probe.capability,
                        address = probe.address,
                        ?regs,
                        "probe implausible, facet disabled"
                    );
                    failed.insert(probe.capability);
                }
                Err(e) => {
                    debug!(
                        charger = %conn.name(),
                        capability = %probe.capability,
                        address = probe.address,
                        error = %e,
                        "probe failed, facet disabled"
                    );
                    failed.insert(probe.capability);
                }
            }
        }

        for capability in failed.iter() {
            passed.remove(capability);
        }

        passed
    }
}
