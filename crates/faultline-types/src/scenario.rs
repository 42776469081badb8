//! Scenario cases and the tables that group them.
//!
//! A [`ScenarioCase`] is immutable once its table is built. Sentinel rows,
//! "all widths" empty arrays and unused-slot markers from table-driven test
//! suites are represented here as plain `Vec` ends, empty `Vec`s and
//! `Option`s.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fault::{FaultDefinition, TargetPosition};
use crate::outcome::OutcomeHypothesis;
use crate::{Lba, LifecycleMask, TopologyKind};

/// Widest raid group any case may target.
pub const MAX_WIDTH: u32 = 16;
/// Fault definitions one case may carry.
pub const MAX_FAULT_DEFINITIONS: usize = 5;
/// Pre-degraded positions one case may declare.
pub const MAX_DEGRADED_POSITIONS: usize = (MAX_WIDTH / 2) as usize;
/// Outcome hypotheses one case may declare.
pub const MAX_HYPOTHESES: usize = 4;
/// Acceptable (status, qualifier) pairs one case may declare.
pub const MAX_STATUS_PAIRS: usize = 2;

/// I/O the generation service issues against the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoOperation {
    /// Plain pattern write. Used to seed the range before a case.
    Write,
    /// Read and check the seeded pattern.
    ReadCheck,
    /// Write a pattern, read it back and check it.
    WriteReadCheck,
    /// Zero the range, read it back and check for zeros.
    ZeroReadCheck,
}

impl IoOperation {
    /// Device operations the request turns into, in issue order.
    #[must_use]
    pub const fn device_opcodes(self) -> &'static [crate::DeviceOpcode] {
        use crate::DeviceOpcode::{Read, Write, WriteSame};
        match self {
            Self::Write => &[Write],
            Self::ReadCheck => &[Read],
            Self::WriteReadCheck => &[Write, Read],
            Self::ZeroReadCheck => &[WriteSame, Read],
        }
    }

    #[must_use]
    pub const fn writes(self) -> bool {
        !matches!(self, Self::ReadCheck)
    }
}

impl fmt::Display for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Write => "write",
            Self::ReadCheck => "read_check",
            Self::WriteReadCheck => "write_read_check",
            Self::ZeroReadCheck => "zero_read_check",
        };
        f.write_str(name)
    }
}

/// Completion status of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoStatus {
    Success,
    IoFailed,
    MediaError,
    Timeout,
    ClientAborted,
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::IoFailed => "IO_FAILED",
            Self::MediaError => "MEDIA_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ClientAborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Refinement of an [`IoStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoQualifier {
    None,
    RetryPossible,
    NotRetryable,
    DataLost,
    Expired,
    ClientRequested,
}

impl fmt::Display for IoQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::RetryPossible => "RETRY_POSSIBLE",
            Self::NotRetryable => "NOT_RETRYABLE",
            Self::DataLost => "DATA_LOST",
            Self::Expired => "EXPIRED",
            Self::ClientRequested => "CLIENT_REQUESTED",
        };
        f.write_str(name)
    }
}

/// One acceptable (status, qualifier) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusPair {
    pub status: IoStatus,
    pub qualifier: IoQualifier,
}

impl StatusPair {
    pub const SUCCESS: Self = Self::new(IoStatus::Success, IoQualifier::None);
    pub const SHUTDOWN: Self = Self::new(IoStatus::IoFailed, IoQualifier::RetryPossible);
    pub const NOT_RETRYABLE: Self = Self::new(IoStatus::IoFailed, IoQualifier::NotRetryable);
    pub const MEDIA_ERROR: Self = Self::new(IoStatus::MediaError, IoQualifier::DataLost);
    pub const EXPIRED: Self = Self::new(IoStatus::Timeout, IoQualifier::Expired);
    pub const ABORTED: Self = Self::new(IoStatus::ClientAborted, IoQualifier::ClientRequested);

    #[must_use]
    pub const fn new(status: IoStatus, qualifier: IoQualifier) -> Self {
        Self { status, qualifier }
    }
}

impl fmt::Display for StatusPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.status, self.qualifier)
    }
}

/// Which object a lifecycle notification is awaited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTarget {
    RaidGroup,
    Volume,
    Drive(TargetPosition),
}

/// Whether the awaited transition happens while the fault is active or only
/// once it has been cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTiming {
    #[default]
    WhileFaulted,
    AfterFaultsCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AwaitedNotification {
    pub target: NotificationTarget,
    pub states: LifecycleMask,
    #[serde(default)]
    pub timing: NotificationTiming,
}

/// Qualification runs on every build; extended adds the long tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteLevel {
    Qualification,
    Extended,
}

impl fmt::Display for SuiteLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qualification => f.write_str("qualification"),
            Self::Extended => f.write_str("extended"),
        }
    }
}

/// One declarative test: a fault set, an I/O, and the outcomes we accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub description: String,
    /// Stable identifier printed in every log line; used to resume a suite
    /// at this case.
    pub source_tag: String,
    pub start_lba: Lba,
    pub block_count: u64,
    pub operation: IoOperation,
    /// `block_count` is in units of the target's element size.
    #[serde(default)]
    pub blocks_are_element_multiple: bool,
    /// Ask the injector to count occurrences on every position.
    #[serde(default)]
    pub apply_fault_across_all_positions: bool,
    pub faults: Vec<FaultDefinition>,
    #[serde(default)]
    pub degraded_positions: Vec<u32>,
    /// Widths this case is valid for; empty means every width.
    #[serde(default)]
    pub widths: Vec<u32>,
    #[serde(default)]
    pub request_expiration: Option<Duration>,
    #[serde(default)]
    pub request_abort: Option<Duration>,
    #[serde(default)]
    pub awaited_notification: Option<AwaitedNotification>,
    pub expected_io_error_count: u32,
    pub acceptable: Vec<StatusPair>,
    pub hypotheses: Vec<OutcomeHypothesis>,
    /// Shorten the drive service timeout so expiration-driven behavior is
    /// deterministic.
    #[serde(default)]
    pub service_timeout_override: bool,
    /// Process-wide I/O expiration to apply while this case runs.
    #[serde(default)]
    pub expiration_override: Option<Duration>,
}

impl ScenarioCase {
    /// Start a case that expects a clean completion and all-zero counters
    /// until told otherwise.
    #[must_use]
    pub fn new(
        source_tag: impl Into<String>,
        description: impl Into<String>,
        operation: IoOperation,
        start_lba: Lba,
        block_count: u64,
    ) -> Self {
        Self {
            description: description.into(),
            source_tag: source_tag.into(),
            start_lba,
            block_count,
            operation,
            blocks_are_element_multiple: false,
            apply_fault_across_all_positions: false,
            faults: Vec::new(),
            degraded_positions: Vec::new(),
            widths: Vec::new(),
            request_expiration: None,
            request_abort: None,
            awaited_notification: None,
            expected_io_error_count: 0,
            acceptable: vec![StatusPair::SUCCESS],
            hypotheses: Vec::new(),
            service_timeout_override: false,
            expiration_override: None,
        }
    }

    #[must_use]
    pub fn fault(mut self, fault: FaultDefinition) -> Self {
        self.faults.push(fault);
        self
    }

    #[must_use]
    pub fn degraded(mut self, positions: &[u32]) -> Self {
        self.degraded_positions = positions.to_vec();
        self
    }

    #[must_use]
    pub fn widths(mut self, widths: &[u32]) -> Self {
        self.widths = widths.to_vec();
        self
    }

    #[must_use]
    pub fn element_multiple(mut self) -> Self {
        self.blocks_are_element_multiple = true;
        self
    }

    #[must_use]
    pub fn all_positions(mut self) -> Self {
        self.apply_fault_across_all_positions = true;
        self
    }

    #[must_use]
    pub fn expiration(mut self, after: Duration) -> Self {
        self.request_expiration = Some(after);
        self
    }

    #[must_use]
    pub fn abort_after(mut self, after: Duration) -> Self {
        self.request_abort = Some(after);
        self
    }

    #[must_use]
    pub fn await_notification(mut self, notification: AwaitedNotification) -> Self {
        self.awaited_notification = Some(notification);
        self
    }

    #[must_use]
    pub fn short_service_timeout(mut self) -> Self {
        self.service_timeout_override = true;
        self
    }

    #[must_use]
    pub fn with_expiration_override(mut self, expiration: Duration) -> Self {
        self.expiration_override = Some(expiration);
        self
    }

    /// Declare the expected error count and the acceptable status pairs.
    #[must_use]
    pub fn expecting(mut self, error_count: u32, acceptable: &[StatusPair]) -> Self {
        self.expected_io_error_count = error_count;
        self.acceptable = acceptable.to_vec();
        self
    }

    #[must_use]
    pub fn hypothesis(mut self, hypothesis: OutcomeHypothesis) -> Self {
        self.hypotheses.push(hypothesis);
        self
    }

    #[must_use]
    pub fn hypothesis_count(&self) -> usize {
        self.hypotheses.len()
    }

    #[must_use]
    pub fn applies_to_width(&self, width: u32) -> bool {
        self.widths.is_empty() || self.widths.contains(&width)
    }

    /// Whether any acceptable pair carries `status`.
    #[must_use]
    pub fn accepts_status(&self, status: IoStatus) -> bool {
        self.acceptable.iter().any(|pair| pair.status == status)
    }

    #[must_use]
    pub fn has_port_fault(&self) -> bool {
        self.faults
            .iter()
            .any(|fault| fault.error_class.is_port_level())
    }

    /// Blocks the request covers once element-size scaling is applied.
    #[must_use]
    pub fn effective_block_count(&self, element_size: u32) -> u64 {
        if self.blocks_are_element_multiple {
            self.block_count.saturating_mul(u64::from(element_size))
        } else {
            self.block_count
        }
    }

    /// Check the case's structural invariants, returning every violation.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut diagnostics = Vec::new();
        let tag = &self.source_tag;

        if self.source_tag.trim().is_empty() {
            diagnostics.push(format!("case '{}' has an empty source tag", self.description));
        }
        if self.block_count == 0 {
            diagnostics.push(format!("{tag}: block_count must be non-zero"));
        }
        if self.faults.len() > MAX_FAULT_DEFINITIONS {
            diagnostics.push(format!(
                "{tag}: {} fault definitions exceed capacity {MAX_FAULT_DEFINITIONS}",
                self.faults.len()
            ));
        }
        if self.has_port_fault() && self.faults.len() != 1 {
            diagnostics.push(format!(
                "{tag}: port-level faults must be the only definition (found {})",
                self.faults.len()
            ));
        }
        if self.faults.iter().any(|fault| fault.occurrences == 0) {
            diagnostics.push(format!("{tag}: fault with zero occurrences"));
        }
        if self.degraded_positions.len() > MAX_DEGRADED_POSITIONS {
            diagnostics.push(format!(
                "{tag}: {} degraded positions exceed {MAX_DEGRADED_POSITIONS}",
                self.degraded_positions.len()
            ));
        }
        let unique: BTreeSet<_> = self.degraded_positions.iter().collect();
        if unique.len() != self.degraded_positions.len() {
            diagnostics.push(format!("{tag}: duplicate degraded positions"));
        }
        if let Some(bad) = self.widths.iter().find(|w| **w == 0 || **w > MAX_WIDTH) {
            diagnostics.push(format!("{tag}: width {bad} outside 1..={MAX_WIDTH}"));
        }
        if self.hypotheses.is_empty() || self.hypotheses.len() > MAX_HYPOTHESES {
            diagnostics.push(format!(
                "{tag}: {} hypotheses, expected 1..={MAX_HYPOTHESES}",
                self.hypotheses.len()
            ));
        }
        if self.acceptable.is_empty() || self.acceptable.len() > MAX_STATUS_PAIRS {
            diagnostics.push(format!(
                "{tag}: {} acceptable status pairs, expected 1..={MAX_STATUS_PAIRS}",
                self.acceptable.len()
            ));
        }
        diagnostics
    }
}

impl fmt::Display for ScenarioCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} lba=0x{:x} blocks=0x{:x}",
            self.source_tag, self.description, self.operation, self.start_lba, self.block_count
        )?;
        if self.blocks_are_element_multiple {
            f.write_str(" x element")?;
        }
        f.write_str(")")
    }
}

/// Ordered group of cases run against one or more topology kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTable {
    pub name: String,
    /// Kinds this table runs against; shared tables list several.
    pub kinds: Vec<TopologyKind>,
    pub level: SuiteLevel,
    pub cases: Vec<ScenarioCase>,
}

impl ScenarioTable {
    #[must_use]
    pub fn applies_to(&self, kind: TopologyKind) -> bool {
        self.kinds.contains(&kind)
    }

    #[must_use]
    pub fn find(&self, source_tag: &str) -> Option<(usize, &ScenarioCase)> {
        self.cases
            .iter()
            .enumerate()
            .find(|(_, case)| case.source_tag == source_tag)
    }

    /// Validate every case plus table-level constraints.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut diagnostics: Vec<String> =
            self.cases.iter().flat_map(ScenarioCase::validate).collect();
        if self.kinds.is_empty() {
            diagnostics.push(format!("table {} targets no topology kind", self.name));
        }
        let mut seen = BTreeSet::new();
        for case in &self.cases {
            if !seen.insert(case.source_tag.as_str()) {
                diagnostics.push(format!(
                    "table {}: duplicate source tag {}",
                    self.name, case.source_tag
                ));
            }
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{DeviceOpcode, FaultDefinition};
    use crate::outcome::{ExpectedCount, OutcomeHypothesis};

    fn base_case() -> ScenarioCase {
        ScenarioCase::new("t-001", "retryable read", IoOperation::ReadCheck, 0, 0x80)
            .fault(FaultDefinition::retryable(DeviceOpcode::Read, 3, 0))
            .hypothesis(OutcomeHypothesis::zero().retryable(3))
    }

    #[test]
    fn well_formed_case_validates() {
        assert!(base_case().validate().is_empty());
    }

    #[test]
    fn missing_hypothesis_is_reported() {
        let mut case = base_case();
        case.hypotheses.clear();
        let diagnostics = case.validate();
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert!(diagnostics[0].contains("0 hypotheses"));
    }

    #[test]
    fn too_many_degraded_positions_is_reported() {
        let case = base_case().degraded(&[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(case.validate().iter().any(|d| d.contains("degraded positions")));
    }

    #[test]
    fn port_fault_must_stand_alone() {
        let case = base_case().fault(FaultDefinition::port_retryable(DeviceOpcode::Read, 2, 1));
        assert!(
            case.validate()
                .iter()
                .any(|d| d.contains("port-level faults must be the only definition"))
        );
    }

    #[test]
    fn three_status_pairs_is_rejected() {
        let case = base_case().expecting(
            1,
            &[StatusPair::SUCCESS, StatusPair::SHUTDOWN, StatusPair::ABORTED],
        );
        assert!(case.validate().iter().any(|d| d.contains("status pairs")));
    }

    #[test]
    fn empty_widths_means_every_width() {
        let case = base_case();
        assert!(case.applies_to_width(3));
        assert!(case.applies_to_width(16));
        let narrowed = base_case().widths(&[3, 5]);
        assert!(narrowed.applies_to_width(5));
        assert!(!narrowed.applies_to_width(4));
    }

    #[test]
    fn element_multiple_scales_block_count() {
        let case = base_case();
        assert_eq!(case.effective_block_count(128), 0x80);
        let scaled =
            ScenarioCase::new("t-002", "x", IoOperation::ReadCheck, 0, 2).element_multiple();
        assert_eq!(scaled.effective_block_count(128), 256);
    }

    #[test]
    fn table_rejects_duplicate_tags() {
        let table = ScenarioTable {
            name: "dup".to_owned(),
            kinds: vec![TopologyKind::Raid5],
            level: SuiteLevel::Qualification,
            cases: vec![base_case(), base_case()],
        };
        assert!(table.validate().iter().any(|d| d.contains("duplicate source tag")));
        assert_eq!(table.find("t-001").map(|(index, _)| index), Some(0));
    }

    #[test]
    fn case_json_roundtrip_keeps_wildcards() {
        let case = base_case().hypothesis(
            OutcomeHypothesis::zero()
                .retryable(ExpectedCount::RangeAroundSingleFail)
                .correctable_media(ExpectedCount::MatchesElementSize),
        );
        let json = serde_json::to_string(&case).expect("encode case");
        let restored: ScenarioCase = serde_json::from_str(&json).expect("decode case");
        assert_eq!(restored, case);
    }
}
