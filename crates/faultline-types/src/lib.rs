pub mod fault;
pub mod outcome;
pub mod scenario;

pub use fault::{DeviceOpcode, FaultDefinition, FaultRegion, ProtocolErrorClass, TargetPosition};
pub use outcome::{CounterFamily, ErrorCounters, ExpectedCount, IoCompletion, OutcomeHypothesis};
pub use scenario::{
    AwaitedNotification, IoOperation, IoQualifier, IoStatus, MAX_DEGRADED_POSITIONS,
    MAX_FAULT_DEFINITIONS, MAX_HYPOTHESES, MAX_STATUS_PAIRS, MAX_WIDTH, NotificationTarget,
    NotificationTiming, ScenarioCase, ScenarioTable, StatusPair, SuiteLevel,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical block address. Block units are whatever the target reports.
pub type Lba = u64;

/// Identifier the administration interface hands out for a live object.
///
/// Object ids are not stable across device removal: a reinserted drive comes
/// back under a new id at the same [`DriveLocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Inclusive block range `[start, end]`, matching how injection records
/// are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: Lba,
    pub end: Lba,
}

impl BlockRange {
    /// Range of `blocks` blocks beginning at `start`. `blocks` must be non-zero.
    #[must_use]
    pub const fn with_len(start: Lba, blocks: u64) -> Self {
        let span = if blocks == 0 { 0 } else { blocks - 1 };
        Self {
            start,
            end: start.saturating_add(span),
        }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}..=0x{:x}", self.start, self.end)
    }
}

/// Physical slot a drive occupies. Survives drive removal and reinsertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriveLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl DriveLocation {
    #[must_use]
    pub const fn new(bus: u32, enclosure: u32, slot: u32) -> Self {
        Self {
            bus,
            enclosure,
            slot,
        }
    }
}

impl fmt::Display for DriveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

/// Rebuild or verify progress marker for one position or verify type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Checkpoint {
    /// Nothing outstanding.
    NonePending,
    /// Work outstanding from this block onward.
    At(Lba),
}

impl Checkpoint {
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::At(_))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonePending => f.write_str("none"),
            Self::At(lba) => write!(f, "0x{lba:x}"),
        }
    }
}

/// Object lifecycle states reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Specialize,
    Activate,
    Ready,
    Hibernate,
    Fail,
    Destroy,
}

impl LifecycleState {
    pub const ALL: [Self; 6] = [
        Self::Specialize,
        Self::Activate,
        Self::Ready,
        Self::Hibernate,
        Self::Fail,
        Self::Destroy,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::Specialize => 1 << 0,
            Self::Activate => 1 << 1,
            Self::Ready => 1 << 2,
            Self::Hibernate => 1 << 3,
            Self::Fail => 1 << 4,
            Self::Destroy => 1 << 5,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Specialize => "SPECIALIZE",
            Self::Activate => "ACTIVATE",
            Self::Ready => "READY",
            Self::Hibernate => "HIBERNATE",
            Self::Fail => "FAIL",
            Self::Destroy => "DESTROY",
        };
        f.write_str(name)
    }
}

/// Set of lifecycle states a notification subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleMask(u8);

impl LifecycleMask {
    #[must_use]
    pub const fn single(state: LifecycleState) -> Self {
        Self(state.bit())
    }

    #[must_use]
    pub fn of(states: &[LifecycleState]) -> Self {
        Self(states.iter().fold(0, |acc, state| acc | state.bit()))
    }

    #[must_use]
    pub const fn contains(self, state: LifecycleState) -> bool {
        self.0 & state.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn states(self) -> impl Iterator<Item = LifecycleState> {
        LifecycleState::ALL
            .into_iter()
            .filter(move |state| self.contains(*state))
    }
}

impl fmt::Display for LifecycleMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.states().map(|state| state.to_string()).collect();
        f.write_str(&names.join("|"))
    }
}

/// Redundancy layout of a target raid group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Raid0,
    Raid1,
    Raid10,
    Raid3,
    Raid5,
    Raid6,
}

impl TopologyKind {
    pub const ALL: [Self; 6] = [
        Self::Raid0,
        Self::Raid1,
        Self::Raid10,
        Self::Raid3,
        Self::Raid5,
        Self::Raid6,
    ];

    /// Number of concurrently failed positions the layout survives.
    #[must_use]
    pub const fn redundancy(self, width: u32) -> u32 {
        match self {
            Self::Raid0 => 0,
            Self::Raid1 => width.saturating_sub(1),
            Self::Raid10 | Self::Raid3 | Self::Raid5 => 1,
            Self::Raid6 => 2,
        }
    }

    /// Parity layouts carry a write log region.
    #[must_use]
    pub const fn is_parity(self) -> bool {
        matches!(self, Self::Raid3 | Self::Raid5 | Self::Raid6)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Raid0 => "raid0",
            Self::Raid1 => "raid1",
            Self::Raid10 => "raid10",
            Self::Raid3 => "raid3",
            Self::Raid5 => "raid5",
            Self::Raid6 => "raid6",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TopologyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown topology kind: {s}"))
    }
}

/// A concrete raid group + volume the harness drives a case against.
///
/// The harness never mutates the topology itself; it only issues fault,
/// degrade and restore operations against the drives behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTopology {
    pub name: String,
    pub kind: TopologyKind,
    pub rg_number: u32,
    pub lun_number: u32,
    /// Drive slot for each position, index = position.
    pub drive_locations: Vec<DriveLocation>,
}

impl TargetTopology {
    #[must_use]
    pub fn width(&self) -> u32 {
        u32::try_from(self.drive_locations.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn location(&self, position: u32) -> Option<DriveLocation> {
        self.drive_locations
            .get(usize::try_from(position).ok()?)
            .copied()
    }

    #[must_use]
    pub fn redundancy(&self) -> u32 {
        self.kind.redundancy(self.width())
    }
}
