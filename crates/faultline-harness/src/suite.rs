//! Suite driver: walks tables and cases in declared order and runs each case
//! on every applicable target.
//!
//! A suite can be resumed mid-table by index or by source tag, capped at a
//! number of cases, narrowed to cases that accept a client abort, and asked
//! to repeat each case. The first failing case stops the suite once the
//! targets already running it have finished.

use std::fmt;
use std::thread;
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use faultline_types::{IoStatus, ScenarioCase, ScenarioTable};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::injector::InjectionLedger;
use crate::log::RunBundle;
use crate::runner::{ScenarioRunReport, ScenarioRunner};
use crate::services::{AdminService, ResolvedTarget, TargetSystem};

/// Where to resume inside the start table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Index(usize),
    SourceTag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteOptions {
    pub start_table: usize,
    pub start_at: Option<StartPoint>,
    pub max_cases: Option<usize>,
    pub repeat_count: u32,
    /// Only cases whose acceptable statuses include a client abort.
    pub abort_only: bool,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            start_table: 0,
            start_at: None,
            max_cases: None,
            repeat_count: 1,
            abort_only: false,
        }
    }
}

/// One case selected for execution.
#[derive(Debug, Clone, Copy)]
pub struct PlannedCase<'t> {
    pub table_index: usize,
    pub case_index: usize,
    pub table: &'t ScenarioTable,
    pub case: &'t ScenarioCase,
}

/// Select the cases a run with `options` visits, in execution order.
///
/// Targets are not known here, so `max_cases` caps planned cases. The
/// driver re-applies the cap to cases that found at least one target.
pub fn plan<'t>(
    tables: &'t [ScenarioTable],
    options: &SuiteOptions,
) -> Result<Vec<PlannedCase<'t>>> {
    if options.repeat_count == 0 {
        return Err(HarnessError::Config {
            key: "repeat_count".to_owned(),
            detail: "must be at least 1".to_owned(),
        });
    }
    if options.start_table >= tables.len() {
        return Err(HarnessError::Config {
            key: "start_table".to_owned(),
            detail: format!(
                "{} is past the last of {} tables",
                options.start_table,
                tables.len()
            ),
        });
    }

    let first_case = resume_index(&tables[options.start_table], options.start_at.as_ref())?;
    let limit = options.max_cases.unwrap_or(usize::MAX);
    let mut planned = Vec::new();

    'tables: for (table_index, table) in tables.iter().enumerate().skip(options.start_table) {
        let skip = if table_index == options.start_table {
            first_case
        } else {
            0
        };
        for (case_index, case) in table.cases.iter().enumerate().skip(skip) {
            if options.abort_only && !case.accepts_status(IoStatus::ClientAborted) {
                continue;
            }
            if planned.len() >= limit {
                break 'tables;
            }
            planned.push(PlannedCase {
                table_index,
                case_index,
                table,
                case,
            });
        }
    }
    Ok(planned)
}

fn resume_index(table: &ScenarioTable, start_at: Option<&StartPoint>) -> Result<usize> {
    match start_at {
        None => Ok(0),
        Some(StartPoint::Index(index)) if *index < table.cases.len() => Ok(*index),
        Some(StartPoint::Index(index)) => Err(HarnessError::Config {
            key: "start_index".to_owned(),
            detail: format!(
                "table {} has {} cases, no index {index}",
                table.name,
                table.cases.len()
            ),
        }),
        Some(StartPoint::SourceTag(tag)) => {
            table
                .find(tag)
                .map(|(index, _)| index)
                .ok_or_else(|| HarnessError::Config {
                    key: "start_tag".to_owned(),
                    detail: format!("no case tagged {tag} in table {}", table.name),
                })
        }
    }
}

// ---- process-wide expiration ----

/// Holds a temporary process-wide I/O expiration. The previous value is put
/// back by [`ExpirationOverride::restore`] or, failing that, on drop.
pub struct ExpirationOverride<'a> {
    admin: &'a dyn AdminService,
    previous: Duration,
    restored: bool,
}

impl<'a> ExpirationOverride<'a> {
    pub fn apply(admin: &'a dyn AdminService, expiration: Duration) -> Result<Self> {
        let previous = admin.default_io_expiration()?;
        admin.set_default_io_expiration(expiration)?;
        debug!(?previous, ?expiration, "io expiration overridden");
        Ok(Self {
            admin,
            previous,
            restored: false,
        })
    }

    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.admin.set_default_io_expiration(self.previous)
    }
}

impl Drop for ExpirationOverride<'_> {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(err) = self.admin.set_default_io_expiration(self.previous) {
                warn!(error = %err, "failed to restore io expiration");
            }
        }
    }
}

impl fmt::Debug for ExpirationOverride<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirationOverride")
            .field("previous", &self.previous)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

// ---- driver ----

#[derive(Debug, Clone, Serialize)]
pub struct SkippedCase {
    pub source_tag: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    pub cases_run: usize,
    pub runs: Vec<ScenarioRunReport>,
    pub skipped: Vec<SkippedCase>,
}

#[derive(Debug, Clone, Copy)]
pub struct SuiteDriver<'a> {
    services: TargetSystem<'a>,
    runner: ScenarioRunner<'a>,
}

impl<'a> SuiteDriver<'a> {
    #[must_use]
    pub const fn new(
        services: TargetSystem<'a>,
        config: &'a HarnessConfig,
        ledger: &'a InjectionLedger,
    ) -> Self {
        Self {
            services,
            runner: ScenarioRunner::new(services, config, ledger),
        }
    }

    #[must_use]
    pub const fn with_bundle(mut self, bundle: &'a RunBundle) -> Self {
        self.runner = self.runner.with_bundle(bundle);
        self
    }

    /// Run every planned case on every target its table and widths allow.
    pub fn run(
        &self,
        tables: &[ScenarioTable],
        targets: &[ResolvedTarget],
        options: &SuiteOptions,
    ) -> Result<SuiteReport> {
        // Skipped cases must not use up the cap, so plan uncapped.
        let uncapped = SuiteOptions {
            max_cases: None,
            ..options.clone()
        };
        let planned = plan(tables, &uncapped)?;
        let limit = options.max_cases.unwrap_or(usize::MAX);
        info!(
            tables = tables.len(),
            targets = targets.len(),
            planned = planned.len(),
            repeat = options.repeat_count,
            abort_only = options.abort_only,
            "suite starting"
        );

        let mut report = SuiteReport::default();
        for entry in planned {
            if report.cases_run >= limit {
                break;
            }
            let case = entry.case;
            let case_targets: Vec<&ResolvedTarget> = targets
                .iter()
                .filter(|target| entry.table.applies_to(target.topology.kind))
                .filter(|target| case.applies_to_width(target.width()))
                .collect();
            if case_targets.is_empty() {
                debug!(case = %case.source_tag, table = %entry.table.name, "no applicable target");
                report.skipped.push(SkippedCase {
                    source_tag: case.source_tag.clone(),
                    reason: format!(
                        "no target of table {} accepts widths {:?}",
                        entry.table.name, case.widths
                    ),
                });
                continue;
            }

            for repeat in 0..options.repeat_count {
                info!(
                    case = %case.source_tag,
                    table = %entry.table.name,
                    index = entry.case_index,
                    repeat,
                    targets = case_targets.len(),
                    "case starting"
                );
                let runs = self.run_case(case, &case_targets)?;
                report.runs.extend(runs);
            }
            report.cases_run += 1;
        }
        info!(cases = report.cases_run, runs = report.runs.len(), "suite finished");
        Ok(report)
    }

    /// One pass of `case` over `targets`, under the case's expiration
    /// override if it has one.
    fn run_case(
        &self,
        case: &ScenarioCase,
        targets: &[&ResolvedTarget],
    ) -> Result<Vec<ScenarioRunReport>> {
        let guard = case
            .expiration_override
            .map(|expiration| ExpirationOverride::apply(self.services.admin, expiration))
            .transpose()?;
        let runs = self.run_on_targets(case, targets);
        let restored = guard.map_or(Ok(()), ExpirationOverride::restore);
        let runs = runs?;
        restored?;
        Ok(runs)
    }

    fn run_on_targets(
        &self,
        case: &ScenarioCase,
        targets: &[&ResolvedTarget],
    ) -> Result<Vec<ScenarioRunReport>> {
        if let [target] = targets {
            return self.runner.run(case, target).map(|run| vec![run]);
        }
        let runner = self.runner;
        let results: Vec<Result<ScenarioRunReport>> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|target| scope.spawn(move || runner.run(case, target)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(HarnessError::internal("scenario runner thread panicked"))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_types::{IoOperation, OutcomeHypothesis, StatusPair, SuiteLevel, TopologyKind};

    fn case(tag: &str) -> ScenarioCase {
        ScenarioCase::new(tag, "plain read", IoOperation::ReadCheck, 0, 8)
            .hypothesis(OutcomeHypothesis::zero())
    }

    fn abort_case(tag: &str) -> ScenarioCase {
        case(tag).expecting(1, &[StatusPair::ABORTED, StatusPair::SUCCESS])
    }

    fn tables() -> Vec<ScenarioTable> {
        vec![
            ScenarioTable {
                name: "first".to_owned(),
                kinds: vec![TopologyKind::Raid5],
                level: SuiteLevel::Qualification,
                cases: vec![case("a-001"), abort_case("a-002"), case("a-003")],
            },
            ScenarioTable {
                name: "second".to_owned(),
                kinds: vec![TopologyKind::Raid5],
                level: SuiteLevel::Qualification,
                cases: vec![abort_case("b-001"), case("b-002")],
            },
        ]
    }

    fn tags(planned: &[PlannedCase<'_>]) -> Vec<String> {
        planned.iter().map(|p| p.case.source_tag.clone()).collect()
    }

    #[test]
    fn default_plan_is_declared_order() {
        let tables = tables();
        let planned = plan(&tables, &SuiteOptions::default()).expect("plan");
        assert_eq!(tags(&planned), ["a-001", "a-002", "a-003", "b-001", "b-002"]);
    }

    #[test]
    fn resume_by_tag_applies_to_start_table_only() {
        let tables = tables();
        let options = SuiteOptions {
            start_at: Some(StartPoint::SourceTag("a-003".to_owned())),
            ..SuiteOptions::default()
        };
        let planned = plan(&tables, &options).expect("plan");
        assert_eq!(tags(&planned), ["a-003", "b-001", "b-002"]);
    }

    #[test]
    fn resume_by_index_in_later_table() {
        let tables = tables();
        let options = SuiteOptions {
            start_table: 1,
            start_at: Some(StartPoint::Index(1)),
            ..SuiteOptions::default()
        };
        assert_eq!(tags(&plan(&tables, &options).expect("plan")), ["b-002"]);
    }

    #[test]
    fn abort_only_and_max_cases_compose() {
        let tables = tables();
        let options = SuiteOptions {
            abort_only: true,
            max_cases: Some(1),
            ..SuiteOptions::default()
        };
        assert_eq!(tags(&plan(&tables, &options).expect("plan")), ["a-002"]);
        let uncapped = SuiteOptions {
            abort_only: true,
            ..SuiteOptions::default()
        };
        assert_eq!(tags(&plan(&tables, &uncapped).expect("plan")), ["a-002", "b-001"]);
    }

    #[test]
    fn bad_resume_points_are_config_errors() {
        let tables = tables();
        for options in [
            SuiteOptions {
                start_table: 2,
                ..SuiteOptions::default()
            },
            SuiteOptions {
                start_at: Some(StartPoint::Index(3)),
                ..SuiteOptions::default()
            },
            SuiteOptions {
                start_at: Some(StartPoint::SourceTag("b-001".to_owned())),
                ..SuiteOptions::default()
            },
            SuiteOptions {
                repeat_count: 0,
                ..SuiteOptions::default()
            },
        ] {
            let err = plan(&tables, &options).expect_err("reject");
            assert!(matches!(err, HarnessError::Config { .. }), "{options:?}: {err}");
        }
    }
}
