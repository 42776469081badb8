//! Built-in scenario catalog.
//!
//! Tables are grouped by the topology kinds they run against. Qualification
//! tables run on every build; extended tables add slower and rarer cases and
//! always run after the qualification ones. The catalog is built once and
//! never mutated; it can be exported to JSON and a JSON catalog can be loaded
//! in its place.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use faultline_types::{
    AwaitedNotification, DeviceOpcode, ExpectedCount, FaultDefinition, FaultRegion, IoOperation,
    LifecycleMask, LifecycleState, NotificationTarget, NotificationTiming, OutcomeHypothesis,
    ScenarioCase, ScenarioTable, StatusPair, SuiteLevel, TargetPosition, TopologyKind,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CATALOG_SCHEMA_VERSION: u32 = 1;

/// Enough retryable errors to push any position past the failure threshold.
const PAST_THRESHOLD: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub schema_version: u32,
    pub tables: Vec<ScenarioTable>,
}

static BUILTIN: OnceLock<Catalog> = OnceLock::new();

/// The built-in catalog.
pub fn builtin() -> &'static Catalog {
    BUILTIN.get_or_init(|| Catalog {
        schema_version: CATALOG_SCHEMA_VERSION,
        tables: vec![
            parity_retry_qualification(),
            parity_timing_qualification(),
            mirror_qualification(),
            striped_qualification(),
            port_qualification(),
            parity_extended(),
            mirror_extended(),
        ],
    })
}

impl Catalog {
    /// Tables to run at `level`, qualification tables first.
    #[must_use]
    pub fn tables_at(&self, level: SuiteLevel) -> Vec<ScenarioTable> {
        let mut tables: Vec<&ScenarioTable> = self
            .tables
            .iter()
            .filter(|table| table.level <= level)
            .collect();
        tables.sort_by_key(|table| table.level);
        tables.into_iter().cloned().collect()
    }

    /// Tables at `level` that target `kind`.
    #[must_use]
    pub fn tables_for(&self, kind: TopologyKind, level: SuiteLevel) -> Vec<ScenarioTable> {
        self.tables_at(level)
            .into_iter()
            .filter(|table| table.applies_to(kind))
            .collect()
    }

    #[must_use]
    pub fn find_case(&self, source_tag: &str) -> Option<(&ScenarioTable, &ScenarioCase)> {
        self.tables
            .iter()
            .find_map(|table| table.find(source_tag).map(|(_, case)| (table, case)))
    }

    /// Every table diagnostic plus catalog-wide tag uniqueness.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut diagnostics: Vec<String> =
            self.tables.iter().flat_map(ScenarioTable::validate).collect();
        let mut names = BTreeSet::new();
        let mut tags = BTreeSet::new();
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                diagnostics.push(format!("duplicate table name {}", table.name));
            }
            for case in &table.cases {
                if !tags.insert(case.source_tag.as_str()) {
                    diagnostics.push(format!(
                        "source tag {} appears in more than one table",
                        case.source_tag
                    ));
                }
            }
        }
        diagnostics
    }

    pub fn export_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!(path = %path.display(), tables = self.tables.len(), "catalog exported");
        Ok(())
    }

    /// Load and validate a JSON catalog.
    pub fn load_json(path: &Path) -> Result<Self> {
        let catalog: Self = serde_json::from_slice(&std::fs::read(path)?)?;
        if catalog.schema_version != CATALOG_SCHEMA_VERSION {
            return Err(HarnessError::Config {
                key: path.display().to_string(),
                detail: format!(
                    "catalog schema {} unsupported, expected {CATALOG_SCHEMA_VERSION}",
                    catalog.schema_version
                ),
            });
        }
        let diagnostics = catalog.validate();
        if !diagnostics.is_empty() {
            return Err(HarnessError::invalid_scenario(
                path.display().to_string(),
                diagnostics.join("; "),
            ));
        }
        Ok(catalog)
    }
}

// ---- builders ----

fn table(
    name: &str,
    kinds: &[TopologyKind],
    level: SuiteLevel,
    cases: Vec<ScenarioCase>,
) -> ScenarioTable {
    ScenarioTable {
        name: name.to_owned(),
        kinds: kinds.to_vec(),
        level,
        cases,
    }
}

fn notify(
    target: NotificationTarget,
    state: LifecycleState,
    timing: NotificationTiming,
) -> AwaitedNotification {
    AwaitedNotification {
        target,
        states: LifecycleMask::single(state),
        timing,
    }
}

/// Enough retryable reads on the last position to fail that drive.
fn last_drive_failing() -> FaultDefinition {
    FaultDefinition::retryable(DeviceOpcode::Read, PAST_THRESHOLD, 0)
        .from_last(0)
        .failing_drive()
}

fn single_fail() -> OutcomeHypothesis {
    OutcomeHypothesis::zero().retryable(ExpectedCount::RangeAroundSingleFail)
}

fn double_fail() -> OutcomeHypothesis {
    OutcomeHypothesis::zero().retryable(ExpectedCount::RangeAroundDoubleFail)
}

/// One element rebuilt from redundancy.
fn element_corrected() -> OutcomeHypothesis {
    OutcomeHypothesis::zero().correctable_media(ExpectedCount::MatchesElementSize)
}

fn element_lost() -> OutcomeHypothesis {
    OutcomeHypothesis::zero().uncorrectable_media(ExpectedCount::MatchesElementSize)
}

/// Shutdown of the raid group: whatever retrying happened, one shutdown.
fn shutdown_hypothesis() -> OutcomeHypothesis {
    OutcomeHypothesis::zero()
        .retryable(ExpectedCount::Any)
        .non_retryable(ExpectedCount::Any)
        .shutdown(1)
}

// ---- qualification ----

fn parity_retry_qualification() -> ScenarioTable {
    use DeviceOpcode::{Read, Write};
    use IoOperation::{ReadCheck, WriteReadCheck};

    table(
        "parity_retry",
        &[TopologyKind::Raid3, TopologyKind::Raid5, TopologyKind::Raid6],
        SuiteLevel::Qualification,
        vec![
            ScenarioCase::new("pq-001", "retryable read absorbed", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, 3, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("pq-002", "retryable read fails last drive", ReadCheck, 0, 0x10)
                .fault(last_drive_failing())
                .await_notification(notify(
                    NotificationTarget::Drive(TargetPosition::FromLast(0)),
                    LifecycleState::Fail,
                    NotificationTiming::WhileFaulted,
                ))
                .hypothesis(single_fail()),
            ScenarioCase::new(
                "pq-003",
                "non-retryable read rebuilt from parity",
                ReadCheck,
                0x100,
                0x10,
            )
            .fault(FaultDefinition::non_retryable(Read, 1, 1))
            .hypothesis(OutcomeHypothesis::zero().non_retryable(1)),
            ScenarioCase::new(
                "pq-004",
                "non-retryable write fails drive",
                WriteReadCheck,
                0x200,
                0x10,
            )
            .fault(FaultDefinition::non_retryable(Write, 1, 0).failing_drive())
            .hypothesis(OutcomeHypothesis::zero().non_retryable(1)),
            ScenarioCase::new("pq-005", "hard media error corrected", ReadCheck, 0, 1)
                .element_multiple()
                .fault(FaultDefinition::hard_media(1, 0))
                .hypothesis(element_corrected()),
            ScenarioCase::new("pq-006", "soft media error corrected", ReadCheck, 0, 1)
                .element_multiple()
                .fault(FaultDefinition::soft_media(1, 1))
                .hypothesis(element_corrected()),
            ScenarioCase::new(
                "pq-007",
                "non-retryable reads on two positions",
                ReadCheck,
                0x40,
                0x10,
            )
            .fault(FaultDefinition::non_retryable(Read, 1, 0))
            .fault(FaultDefinition::non_retryable(Read, 1, 1))
            .expecting(0, &[StatusPair::SUCCESS, StatusPair::NOT_RETRYABLE])
            .hypothesis(OutcomeHypothesis::zero().non_retryable(2)),
            ScenarioCase::new("pq-008", "short service timeout cuts retries", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0))
                .short_service_timeout()
                .hypothesis(OutcomeHypothesis::zero().retryable(5)),
            ScenarioCase::new("pq-009", "retryable paged metadata write", IoOperation::Write, 0, 8)
                .fault(
                    FaultDefinition::retryable(Write, 3, 0).in_region(FaultRegion::PagedMetadata),
                )
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("pq-010", "retryable write log write", IoOperation::Write, 0, 8)
                .fault(FaultDefinition::retryable(Write, 2, 0).in_region(FaultRegion::WriteLog))
                .hypothesis(OutcomeHypothesis::zero().retryable(2)),
        ],
    )
}

fn parity_timing_qualification() -> ScenarioTable {
    use DeviceOpcode::Read;
    use IoOperation::ReadCheck;

    table(
        "parity_timing",
        &[TopologyKind::Raid3, TopologyKind::Raid5, TopologyKind::Raid6],
        SuiteLevel::Qualification,
        vec![
            ScenarioCase::new("pt-001", "client abort during retries", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0))
                .abort_after(Duration::from_millis(450))
                .expecting(1, &[StatusPair::ABORTED])
                .hypothesis(OutcomeHypothesis::zero().retryable(5)),
            ScenarioCase::new("pt-002", "process expiration during retries", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0))
                .with_expiration_override(Duration::from_millis(300))
                .expecting(1, &[StatusPair::EXPIRED])
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("pt-003", "request expiration during retries", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0))
                .expiration(Duration::from_millis(250))
                .expecting(1, &[StatusPair::EXPIRED])
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
        ],
    )
}

fn mirror_qualification() -> ScenarioTable {
    use DeviceOpcode::Read;
    use IoOperation::ReadCheck;

    table(
        "mirror",
        &[TopologyKind::Raid1, TopologyKind::Raid10],
        SuiteLevel::Qualification,
        vec![
            ScenarioCase::new("mq-001", "retryable read absorbed", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, 3, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("mq-002", "degraded mirror absorbs retries", ReadCheck, 0, 0x10)
                .degraded(&[1])
                .fault(FaultDefinition::retryable(Read, 3, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("mq-003", "degraded mirror loses last copy", ReadCheck, 0, 0x10)
                .degraded(&[1])
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0).failing_drive())
                .await_notification(notify(
                    NotificationTarget::RaidGroup,
                    LifecycleState::Fail,
                    NotificationTiming::WhileFaulted,
                ))
                .expecting(1, &[StatusPair::SHUTDOWN])
                .hypothesis(shutdown_hypothesis())
                .hypothesis(OutcomeHypothesis::zero().shutdown(0)),
            ScenarioCase::new("mq-004", "hard media error on degraded mirror", ReadCheck, 0, 1)
                .element_multiple()
                .degraded(&[1])
                .fault(FaultDefinition::hard_media(1, 0))
                .expecting(1, &[StatusPair::MEDIA_ERROR])
                .hypothesis(element_lost()),
        ],
    )
}

fn striped_qualification() -> ScenarioTable {
    use DeviceOpcode::Read;
    use IoOperation::ReadCheck;

    table(
        "striped",
        &[TopologyKind::Raid0],
        SuiteLevel::Qualification,
        vec![
            ScenarioCase::new("sq-001", "retryable read absorbed", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, 3, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("sq-002", "failed drive shuts the stripe down", ReadCheck, 0, 0x10)
                .fault(last_drive_failing())
                .await_notification(notify(
                    NotificationTarget::Volume,
                    LifecycleState::Fail,
                    NotificationTiming::WhileFaulted,
                ))
                .expecting(1, &[StatusPair::SHUTDOWN])
                .hypothesis(shutdown_hypothesis())
                .hypothesis(OutcomeHypothesis::zero().shutdown(0)),
            ScenarioCase::new("sq-003", "soft media error corrected", ReadCheck, 0, 1)
                .element_multiple()
                .fault(FaultDefinition::soft_media(1, 0))
                .hypothesis(element_corrected()),
        ],
    )
}

fn port_qualification() -> ScenarioTable {
    use DeviceOpcode::Read;
    use IoOperation::ReadCheck;

    table(
        "port",
        &[TopologyKind::Raid1, TopologyKind::Raid5, TopologyKind::Raid6],
        SuiteLevel::Qualification,
        vec![
            // A background scan can eat one occurrence before the I/O does.
            ScenarioCase::new("pp-001", "port retries absorbed", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::port_retryable(Read, 3, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3))
                .hypothesis(OutcomeHypothesis::zero().retryable(2)),
            ScenarioCase::new("pp-002", "port retries bounce the link", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::port_retryable(Read, PAST_THRESHOLD, 0))
                .await_notification(notify(
                    NotificationTarget::Drive(TargetPosition::Absolute(0)),
                    LifecycleState::Ready,
                    NotificationTiming::AfterFaultsCleared,
                ))
                .hypothesis(single_fail()),
        ],
    )
}

// ---- extended ----

fn parity_extended() -> ScenarioTable {
    use DeviceOpcode::{Read, WriteSame};
    use IoOperation::{ReadCheck, ZeroReadCheck};

    table(
        "parity_extended",
        &[TopologyKind::Raid5, TopologyKind::Raid6],
        SuiteLevel::Extended,
        vec![
            ScenarioCase::new("px-001", "retryable reads on every position", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, 2, 0))
                .all_positions()
                .hypothesis(OutcomeHypothesis::zero().retryable(6))
                .hypothesis(OutcomeHypothesis::zero().retryable(10))
                .hypothesis(OutcomeHypothesis::zero().retryable(12)),
            ScenarioCase::new("px-002", "two drives fail on one read", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0).failing_drive())
                .fault(last_drive_failing())
                .expecting(0, &[StatusPair::SUCCESS, StatusPair::SHUTDOWN])
                .hypothesis(
                    OutcomeHypothesis::zero()
                        .retryable(ExpectedCount::RangeAroundDoubleFail)
                        .shutdown(1),
                )
                .hypothesis(double_fail()),
            ScenarioCase::new("px-003", "retryable read in secondary chunk", ReadCheck, 0x800, 8)
                .fault(
                    FaultDefinition::retryable(Read, 3, 0)
                        .in_region(FaultRegion::UserDataSecondaryChunk),
                )
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new(
                "px-004",
                "hard media anywhere in protected space",
                ReadCheck,
                0x3000,
                0x20,
            )
            .fault(FaultDefinition::hard_media(1, 1).in_region(FaultRegion::AllRaidProtected))
            .hypothesis(OutcomeHypothesis::zero().correctable_media(0x20))
            .hypothesis(OutcomeHypothesis::zero().correctable_media(ExpectedCount::NonZero)),
            ScenarioCase::new("px-005", "retryable write-same on zeroing", ZeroReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(WriteSame, 4, 0))
                .hypothesis(OutcomeHypothesis::zero().retryable(4)),
        ],
    )
}

fn mirror_extended() -> ScenarioTable {
    use DeviceOpcode::Read;
    use IoOperation::ReadCheck;

    table(
        "mirror_extended",
        &[TopologyKind::Raid1, TopologyKind::Raid10],
        SuiteLevel::Extended,
        vec![
            ScenarioCase::new("mx-001", "client abort on mirror retries", ReadCheck, 0, 0x10)
                .fault(FaultDefinition::retryable(Read, PAST_THRESHOLD, 0))
                .abort_after(Duration::from_millis(250))
                .expecting(1, &[StatusPair::ABORTED])
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
            ScenarioCase::new("mx-002", "retries on the surviving half", ReadCheck, 0x80, 0x10)
                .widths(&[4])
                .degraded(&[0])
                .fault(FaultDefinition::retryable(Read, 3, 0).from_last(0))
                .hypothesis(OutcomeHypothesis::zero().retryable(3)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_valid() {
        let diagnostics = builtin().validate();
        assert!(diagnostics.is_empty(), "{diagnostics:#?}");
    }

    #[test]
    fn extended_level_keeps_qualification_first() {
        let tables = builtin().tables_at(SuiteLevel::Extended);
        let first_extended = tables
            .iter()
            .position(|t| t.level == SuiteLevel::Extended)
            .expect("extended tables");
        assert!(tables[..first_extended].iter().all(|t| t.level == SuiteLevel::Qualification));
        assert!(tables[first_extended..].iter().all(|t| t.level == SuiteLevel::Extended));
        assert!(builtin().tables_at(SuiteLevel::Qualification).len() < tables.len());
    }

    #[test]
    fn kind_filter_includes_shared_tables() {
        let names: Vec<String> = builtin()
            .tables_for(TopologyKind::Raid1, SuiteLevel::Qualification)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["mirror", "port"]);
    }

    #[test]
    fn find_case_by_tag() {
        let (table, case) = builtin().find_case("pt-001").expect("pt-001");
        assert_eq!(table.name, "parity_timing");
        assert!(case.request_abort.is_some());
        assert!(builtin().find_case("zz-999").is_none());
    }

    #[test]
    fn export_then_load_keeps_every_case() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        builtin().export_json(&path).expect("export");
        let loaded = Catalog::load_json(&path).expect("load");
        assert_eq!(&loaded, builtin());
    }

    #[test]
    fn invalid_loaded_catalog_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let mut catalog = builtin().clone();
        catalog.tables[0].cases[0].hypotheses.clear();
        catalog.export_json(&path).expect("export");
        let err = Catalog::load_json(&path).expect_err("reject");
        assert!(err.to_string().contains("pq-001"), "{err}");
    }
}
