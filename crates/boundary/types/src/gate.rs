use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the eight enforcement gates every crossing must pass.
///
/// The declaration order is the canonical evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GateId {
    K1,
    K2,
    K3,
    K4,
    K5,
    K6,
    K7,
    K8,
}

impl GateId {
    /// All gates in canonical order.
    pub const ALL: [GateId; 8] = [
        GateId::K1,
        GateId::K2,
        GateId::K3,
        GateId::K4,
        GateId::K5,
        GateId::K6,
        GateId::K7,
        GateId::K8,
    ];

    /// Zero-based position in the canonical order.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn category(self) -> GateCategory {
        match self {
            GateId::K1 => GateCategory::Schema,
            GateId::K2 => GateCategory::Permission,
            GateId::K3 => GateCategory::Bounds,
            GateId::K4 => GateCategory::Trace,
            GateId::K5 => GateCategory::Idempotency,
            GateId::K6 => GateCategory::Durability,
            GateId::K7 => GateCategory::HumanApproval,
            GateId::K8 => GateCategory::BehavioralEval,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateId::K1 => "K1",
            GateId::K2 => "K2",
            GateId::K3 => "K3",
            GateId::K4 => "K4",
            GateId::K5 => "K5",
            GateId::K6 => "K6",
            GateId::K7 => "K7",
            GateId::K8 => "K8",
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateId {
    type Err = GateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GateIdError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown gate id: {0} (expected K1..K8)")]
pub struct GateIdError(pub String);

/// What a gate checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateCategory {
    Schema,
    Permission,
    Bounds,
    Trace,
    Idempotency,
    Durability,
    HumanApproval,
    BehavioralEval,
}

impl fmt::Display for GateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateCategory::Schema => "schema",
            GateCategory::Permission => "permission",
            GateCategory::Bounds => "bounds",
            GateCategory::Trace => "trace",
            GateCategory::Idempotency => "idempotency",
            GateCategory::Durability => "durability",
            GateCategory::HumanApproval => "human-approval",
            GateCategory::BehavioralEval => "behavioral-eval",
        };
        f.write_str(name)
    }
}

/// Safety integrity level declared by a gate implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Sil {
    Sil1,
    Sil2,
    Sil3,
    Sil4,
}

impl Default for Sil {
    fn default() -> Self {
        Sil::Sil2
    }
}

/// A subset of the eight gates, stored as a bitmask.
///
/// Serializes as an ordered list of gate ids.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GateSet(u8);

impl GateSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The full set K1..K8.
    pub const fn all() -> Self {
        Self(u8::MAX)
    }

    pub fn insert(&mut self, gate: GateId) -> bool {
        let had = self.contains(gate);
        self.0 |= gate.bit();
        !had
    }

    pub fn remove(&mut self, gate: GateId) -> bool {
        let had = self.contains(gate);
        self.0 &= !gate.bit();
        had
    }

    pub fn contains(&self, gate: GateId) -> bool {
        self.0 & gate.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_all(&self) -> bool {
        self.0 == u8::MAX
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn intersection(&self, other: &GateSet) -> GateSet {
        GateSet(self.0 & other.0)
    }

    pub fn is_disjoint(&self, other: &GateSet) -> bool {
        self.intersection(other).is_empty()
    }

    /// Gates in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = GateId> + '_ {
        GateId::ALL.into_iter().filter(move |g| self.contains(*g))
    }
}

impl FromIterator<GateId> for GateSet {
    fn from_iter<I: IntoIterator<Item = GateId>>(iter: I) -> Self {
        let mut set = GateSet::empty();
        for gate in iter {
            set.insert(gate);
        }
        set
    }
}

impl fmt::Debug for GateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for GateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, gate) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", gate)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for GateSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for GateSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let gates = Vec::<GateId>::deserialize(deserializer)?;
        Ok(gates.into_iter().collect())
    }
}
