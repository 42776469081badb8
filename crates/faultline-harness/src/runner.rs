//! Scenario runner: executes one case against one target.
//!
//! The phase order is fixed:
//!
//! ```text
//! Seeded -> Degraded -> NotificationArmed -> FaultsArmed -> IoIssued
//!   -> AwaitingIoCompletion -> [AwaitingLifecycleNotification]
//!   -> FaultsDisarmed -> DevicesRestored -> Validated
//!   -> AwaitingQuiescence -> Done
//! ```
//!
//! The subscription is taken before any fault is armed, faults are only
//! disarmed once the I/O has completed, devices are restored before the
//! counters are judged, and background rebuild/verify work is awaited last.
//! A notification that only fires once the fault is gone is awaited right
//! after disarm.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use faultline_types::{
    AwaitedNotification, IoCompletion, IoOperation, IoStatus, LifecycleState, NotificationTarget,
    NotificationTiming, ObjectId, ScenarioCase,
};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::HarnessConfig;
use crate::controller::StateController;
use crate::injector::{FaultInjector, InjectionLedger};
use crate::log::{RunBundle, RunEvent, RunEventKind, RunStatus};
use crate::matcher::{self, MatchContext, OutcomeVerdict};
use crate::services::{
    IoRequest, LifecycleNotifications, ResolvedTarget, SubscriptionId, TargetSystem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    Seeded,
    Degraded,
    NotificationArmed,
    FaultsArmed,
    IoIssued,
    AwaitingIoCompletion,
    AwaitingLifecycleNotification,
    FaultsDisarmed,
    DevicesRestored,
    Validated,
    AwaitingQuiescence,
    Done,
}

impl RunnerPhase {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Degraded => "degraded",
            Self::NotificationArmed => "notification_armed",
            Self::FaultsArmed => "faults_armed",
            Self::IoIssued => "io_issued",
            Self::AwaitingIoCompletion => "awaiting_io_completion",
            Self::AwaitingLifecycleNotification => "awaiting_lifecycle_notification",
            Self::FaultsDisarmed => "faults_disarmed",
            Self::DevicesRestored => "devices_restored",
            Self::Validated => "validated",
            Self::AwaitingQuiescence => "awaiting_quiescence",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What one successful case run observed.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRunReport {
    pub source_tag: String,
    pub target: String,
    pub phases: Vec<RunnerPhase>,
    pub completion: IoCompletion,
    pub verdict: OutcomeVerdict,
    pub notification: Option<LifecycleState>,
    pub restored_drives: usize,
}

/// Runs cases against targets through one set of services.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioRunner<'a> {
    services: TargetSystem<'a>,
    config: &'a HarnessConfig,
    ledger: &'a InjectionLedger,
    bundle: Option<&'a RunBundle>,
}

impl<'a> ScenarioRunner<'a> {
    #[must_use]
    pub const fn new(
        services: TargetSystem<'a>,
        config: &'a HarnessConfig,
        ledger: &'a InjectionLedger,
    ) -> Self {
        Self {
            services,
            config,
            ledger,
            bundle: None,
        }
    }

    /// Also record phases and verdicts in `bundle`.
    #[must_use]
    pub const fn with_bundle(mut self, bundle: &'a RunBundle) -> Self {
        self.bundle = Some(bundle);
        self
    }

    /// Run `case` against `target`. Any error carries the case's tag,
    /// description and the target name.
    pub fn run(&self, case: &ScenarioCase, target: &ResolvedTarget) -> Result<ScenarioRunReport> {
        self.run_phases(case, target).map_err(|err| {
            error!(
                case = %case.source_tag,
                target = target.name(),
                error = %err,
                "scenario failed"
            );
            err.in_scenario(&case.source_tag, &case.description, target.name())
        })
    }

    fn run_phases(
        &self,
        case: &ScenarioCase,
        target: &ResolvedTarget,
    ) -> Result<ScenarioRunReport> {
        let tag = case.source_tag.as_str();
        let diagnostics = case.validate();
        if !diagnostics.is_empty() {
            return Err(HarnessError::invalid_scenario(tag, diagnostics.join("; ")));
        }

        let mut trace = PhaseTrace::new(self.bundle, tag, target.name());
        trace.event(
            RunEvent::new(RunEventKind::CaseStart, case.to_string())
                .with("width", target.width())
                .with("kind", target.topology.kind.label()),
        )?;

        let controller = StateController::new(self.services, self.config);
        let blocks = case.effective_block_count(target.geometry.element_size);

        if self.config.seed_pattern {
            self.seed(case, target, blocks)?;
        }
        trace.enter(RunnerPhase::Seeded)?;

        controller.degrade(case, target)?;
        trace.enter(RunnerPhase::Degraded)?;

        let subscription = case
            .awaited_notification
            .map(|awaited| self.subscribe(tag, awaited, target))
            .transpose()?;
        trace.enter(RunnerPhase::NotificationArmed)?;

        let injector =
            FaultInjector::new(self.services, self.ledger, self.config.short_service_timeout);
        let armed = injector.arm(case, target)?;
        trace.enter(RunnerPhase::FaultsArmed)?;

        let request = IoRequest {
            operation: case.operation,
            lba: case.start_lba,
            blocks,
            expiration: case.request_expiration,
            abort_after: case.request_abort,
        };
        let ticket = self.services.io.start_io(target.volume, &request)?;
        trace.enter(RunnerPhase::IoIssued)?;

        trace.enter(RunnerPhase::AwaitingIoCompletion)?;
        let completion = self.services.io.wait_io(ticket, self.config.io_ceiling)?;
        info!(case = tag, target = target.name(), %completion, "io completed");

        let mut notification = None;
        if let Some(subscription) = subscription
            .as_ref()
            .filter(|s| s.awaited.timing == NotificationTiming::WhileFaulted)
        {
            trace.enter(RunnerPhase::AwaitingLifecycleNotification)?;
            notification = Some(subscription.await_delivery(self.config.notification_ceiling)?);
        }

        armed.disarm()?;
        trace.enter(RunnerPhase::FaultsDisarmed)?;

        if let Some(subscription) = subscription {
            if subscription.awaited.timing == NotificationTiming::AfterFaultsCleared {
                trace.enter(RunnerPhase::AwaitingLifecycleNotification)?;
                notification = Some(subscription.await_delivery(self.config.notification_ceiling)?);
            }
            subscription.release()?;
        }

        let positions = restore_positions(case, target)?;
        let restored_drives = controller.restore(tag, &positions, target)?;
        trace.enter(RunnerPhase::DevicesRestored)?;

        let ctx = MatchContext::new(
            target.geometry.element_size,
            self.services.admin.retry_error_threshold()?,
        );
        let verdict = matcher::evaluate(case, &completion, &ctx);
        let status = if verdict.passed() {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        trace.event(
            RunEvent::new(RunEventKind::Verdict, completion.to_string())
                .with_status(status)
                .with("matched", verdict.matched.map(|index| index as u64))
                .with("attempts", verdict.attempts.len() as u64),
        )?;
        if !verdict.passed() {
            let report = verdict.render(case);
            if let Some(bundle) = self.bundle {
                bundle.record_failure(tag, target.name(), &report)?;
            }
            return Err(HarnessError::Validation {
                source_tag: tag.to_owned(),
                report,
            });
        }
        trace.enter(RunnerPhase::Validated)?;

        trace.enter(RunnerPhase::AwaitingQuiescence)?;
        controller.await_rebuilds(target)?;
        controller.await_verifies(target)?;
        trace.enter(RunnerPhase::Done)?;
        trace.event(
            RunEvent::new(RunEventKind::CaseEnd, "case_end").with_status(RunStatus::Passed),
        )?;

        Ok(ScenarioRunReport {
            source_tag: tag.to_owned(),
            target: target.name().to_owned(),
            phases: trace.phases,
            completion,
            verdict,
            notification,
            restored_drives,
        })
    }

    /// Write the case's range with a known pattern so read checks have
    /// something to compare against.
    fn seed(&self, case: &ScenarioCase, target: &ResolvedTarget, blocks: u64) -> Result<()> {
        let request = IoRequest {
            operation: IoOperation::Write,
            lba: case.start_lba,
            blocks,
            expiration: None,
            abort_after: None,
        };
        let ticket = self.services.io.start_io(target.volume, &request)?;
        let completion = self.services.io.wait_io(ticket, self.config.io_ceiling)?;
        if completion.status != IoStatus::Success {
            return Err(HarnessError::service(
                "io",
                format!(
                    "seed write of {blocks} blocks at 0x{:x} failed: {completion}",
                    case.start_lba
                ),
            ));
        }
        debug!(case = %case.source_tag, blocks, "range seeded");
        Ok(())
    }

    fn subscribe(
        &self,
        tag: &str,
        awaited: AwaitedNotification,
        target: &ResolvedTarget,
    ) -> Result<Subscription<'a>> {
        let object = match awaited.target {
            NotificationTarget::RaidGroup => target.raid_group,
            NotificationTarget::Volume => target.volume,
            NotificationTarget::Drive(position) => {
                let position = target.position(tag, position)?;
                target.drive(self.services.admin, tag, position)?.1
            }
        };
        let id = self.services.notifications.subscribe(object, awaited.states)?;
        debug!(case = tag, %object, states = %awaited.states, "lifecycle subscription taken");
        Ok(Subscription {
            notifications: self.services.notifications,
            id,
            object,
            awaited,
            released: false,
        })
    }
}

/// Every position a case may have left failed: the pre-degraded ones and
/// every faulted one (all of them when faults span every position).
fn restore_positions(case: &ScenarioCase, target: &ResolvedTarget) -> Result<Vec<u32>> {
    let tag = case.source_tag.as_str();
    let mut positions: BTreeSet<u32> = case.degraded_positions.iter().copied().collect();
    if case.apply_fault_across_all_positions && !case.faults.is_empty() {
        positions.extend(0..target.width());
    }
    for fault in &case.faults {
        positions.insert(target.position(tag, fault.position)?);
    }
    Ok(positions.into_iter().collect())
}

// ---- lifecycle subscription ----

struct Subscription<'a> {
    notifications: &'a dyn LifecycleNotifications,
    id: SubscriptionId,
    object: ObjectId,
    awaited: AwaitedNotification,
    released: bool,
}

impl Subscription<'_> {
    fn await_delivery(&self, ceiling: Duration) -> Result<LifecycleState> {
        match self.notifications.wait(self.id, ceiling)? {
            Some(state) => {
                info!(object = %self.object, %state, "lifecycle notification delivered");
                Ok(state)
            }
            None => Err(HarnessError::timeout(
                format!("{} on {}", self.awaited.states, self.object),
                ceiling,
                "no notification delivered",
            )),
        }
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        self.notifications.unsubscribe(self.id)
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.notifications.unsubscribe(self.id);
        }
    }
}

// ---- phase bookkeeping ----

struct PhaseTrace<'a> {
    bundle: Option<&'a RunBundle>,
    source_tag: &'a str,
    target: &'a str,
    phases: Vec<RunnerPhase>,
}

impl<'a> PhaseTrace<'a> {
    fn new(bundle: Option<&'a RunBundle>, source_tag: &'a str, target: &'a str) -> Self {
        Self {
            bundle,
            source_tag,
            target,
            phases: Vec::with_capacity(12),
        }
    }

    fn enter(&mut self, phase: RunnerPhase) -> Result<()> {
        debug!(case = self.source_tag, target = self.target, %phase, "phase");
        self.phases.push(phase);
        self.event(RunEvent::new(RunEventKind::Phase, phase.label()))
    }

    fn event(&self, event: RunEvent) -> Result<()> {
        match self.bundle {
            Some(bundle) => bundle.emit(event.for_case(self.source_tag, self.target)),
            None => Ok(()),
        }
    }
}
