//! Call ordering the runner guarantees against the array, checked through
//! the simulated array's journal.

use std::time::Duration;

use faultline_harness::config::HarnessConfig;
use faultline_harness::injector::InjectionLedger;
use faultline_harness::runner::{RunnerPhase, ScenarioRunner};
use faultline_harness::services::{ResolvedTarget, TargetSystem};
use faultline_harness::sim::{SimEvent, SimulatedArray};
use faultline_types::{
    AwaitedNotification, CounterFamily, DeviceOpcode, ExpectedCount, FaultDefinition, IoOperation,
    LifecycleMask, LifecycleState, NotificationTarget, NotificationTiming, OutcomeHypothesis,
    ScenarioCase, StatusPair, TargetPosition, TopologyKind,
};
use proptest::prelude::*;

fn fast_config() -> HarnessConfig {
    HarnessConfig {
        poll_interval: Duration::from_millis(1),
        state_ceiling: Duration::from_millis(500),
        rebuild_ceiling: Duration::from_millis(500),
        verify_ceiling: Duration::from_millis(500),
        notification_ceiling: Duration::from_millis(20),
        ..HarnessConfig::default()
    }
}

fn setup(kind: TopologyKind, width: u32) -> (SimulatedArray, ResolvedTarget) {
    let sim = SimulatedArray::new();
    let topology = sim.add_raid_group(&format!("{kind}-w{width}"), kind, width);
    let target = ResolvedTarget::resolve(&topology, &sim).expect("resolve");
    (sim, target)
}

fn first(journal: &[SimEvent], pred: impl Fn(&SimEvent) -> bool) -> Option<usize> {
    journal.iter().position(pred)
}

fn last(journal: &[SimEvent], pred: impl Fn(&SimEvent) -> bool) -> Option<usize> {
    journal.iter().rposition(pred)
}

fn record_removed(event: &SimEvent) -> bool {
    matches!(event, SimEvent::RecordRemoved { .. })
}

fn case_io_started(event: &SimEvent) -> bool {
    matches!(event, SimEvent::IoStarted { operation: IoOperation::ReadCheck, .. })
}

/// Checks that hold for every run, passing or not.
fn assert_ordering(journal: &[SimEvent]) {
    let Some(first_added) = first(journal, |e| matches!(e, SimEvent::RecordAdded { .. })) else {
        return;
    };
    let last_added = last(journal, |e| matches!(e, SimEvent::RecordAdded { .. })).expect("added");

    if let Some(subscribed) = first(journal, |e| matches!(e, SimEvent::Subscribed { .. })) {
        assert!(subscribed < first_added, "subscription after arming: {journal:#?}");
        assert!(
            journal.iter().any(|e| matches!(e, SimEvent::Unsubscribed { .. })),
            "subscription never released: {journal:#?}"
        );
    }

    let first_removed = first(journal, record_removed).expect("every armed record is removed");
    let last_removed = last(journal, record_removed).expect("removed");
    let io_started = first(journal, case_io_started).expect("case io issued");
    assert!(last_added < io_started, "record armed after io start: {journal:#?}");

    let SimEvent::IoStarted { ticket, .. } = &journal[io_started] else {
        unreachable!("matched above");
    };
    let io_waited = first(journal, |e| matches!(e, SimEvent::IoWaited { ticket: t } if t == ticket))
        .expect("case io waited");
    assert!(io_waited < first_removed, "records removed before io completed: {journal:#?}");

    if let Some(released) = first(journal, |e| matches!(e, SimEvent::ObjectReleased { .. })) {
        assert!(io_waited < released, "drive released before io completed: {journal:#?}");
    }
    let stopped =
        last(journal, |e| matches!(e, SimEvent::InjectionStopped)).expect("injection stopped");
    assert!(last_removed < stopped, "injection stopped with records armed: {journal:#?}");
    if let Some(drive_removed) = first(journal, |e| matches!(e, SimEvent::DriveRemoved { .. })) {
        assert!(last_removed < drive_removed, "drive cycled while faulted: {journal:#?}");
    }
}

#[test]
fn notification_is_taken_before_arming_and_seen_before_disarm() {
    let (sim, target) = setup(TopologyKind::Raid1, 2);
    let config = fast_config();
    let ledger = InjectionLedger::new();
    let runner = ScenarioRunner::new(TargetSystem::from_backend(&sim), &config, &ledger);
    let case = ScenarioCase::new(
        "ord-001",
        "degraded mirror loses last copy",
        IoOperation::ReadCheck,
        0,
        0x10,
    )
    .degraded(&[1])
    .fault(FaultDefinition::retryable(DeviceOpcode::Read, 20, 0).failing_drive())
    .await_notification(AwaitedNotification {
        target: NotificationTarget::RaidGroup,
        states: LifecycleMask::single(LifecycleState::Fail),
        timing: NotificationTiming::WhileFaulted,
    })
    .expecting(1, &[StatusPair::SHUTDOWN])
    .hypothesis(
        OutcomeHypothesis::zero()
            .retryable(ExpectedCount::Any)
            .non_retryable(ExpectedCount::Any)
            .shutdown(1),
    );

    let report = runner.run(&case, &target).expect("run");
    assert_eq!(report.notification, Some(LifecycleState::Fail));
    assert_eq!(report.restored_drives, 2);

    let journal = sim.journal();
    assert_ordering(&journal);
    let delivered = first(&journal, |e| matches!(e, SimEvent::NotificationDelivered { .. }))
        .expect("delivered");
    let removed = first(&journal, record_removed).expect("removed");
    assert!(delivered < removed, "notification delivered after disarm: {journal:#?}");

    let notified = report
        .phases
        .iter()
        .position(|p| *p == RunnerPhase::AwaitingLifecycleNotification)
        .expect("notification phase");
    let disarmed = report
        .phases
        .iter()
        .position(|p| *p == RunnerPhase::FaultsDisarmed)
        .expect("disarm phase");
    assert!(notified < disarmed);
}

#[test]
fn after_clear_notification_is_awaited_past_disarm() {
    let (sim, target) = setup(TopologyKind::Raid1, 2);
    let config = fast_config();
    let ledger = InjectionLedger::new();
    let runner = ScenarioRunner::new(TargetSystem::from_backend(&sim), &config, &ledger);
    let case = ScenarioCase::new("ord-002", "link bounce", IoOperation::ReadCheck, 0, 0x10)
        .fault(FaultDefinition::port_retryable(DeviceOpcode::Read, 20, 1))
        .await_notification(AwaitedNotification {
            target: NotificationTarget::Drive(TargetPosition::Absolute(1)),
            states: LifecycleMask::single(LifecycleState::Ready),
            timing: NotificationTiming::AfterFaultsCleared,
        })
        .hypothesis(OutcomeHypothesis::zero().retryable(ExpectedCount::Any));

    let report = runner.run(&case, &target).expect("run");
    assert_eq!(report.notification, Some(LifecycleState::Ready));

    let journal = sim.journal();
    assert_ordering(&journal);
    let released =
        first(&journal, |e| matches!(e, SimEvent::ObjectReleased { .. })).expect("released");
    let delivered = first(&journal, |e| {
        matches!(e, SimEvent::NotificationDelivered { state: LifecycleState::Ready, .. })
    })
    .expect("ready delivered");
    assert!(released < delivered, "ready seen before the drive was released: {journal:#?}");

    let disarmed = report
        .phases
        .iter()
        .position(|p| *p == RunnerPhase::FaultsDisarmed)
        .expect("disarm");
    let notified = report
        .phases
        .iter()
        .position(|p| *p == RunnerPhase::AwaitingLifecycleNotification)
        .expect("notification phase");
    assert!(disarmed < notified);
}

#[test]
fn restore_after_a_passing_run_touches_nothing() {
    let (sim, target) = setup(TopologyKind::Raid5, 3);
    let config = fast_config();
    let ledger = InjectionLedger::new();
    let runner = ScenarioRunner::new(TargetSystem::from_backend(&sim), &config, &ledger);
    let case = ScenarioCase::new(
        "ord-003",
        "retryable read absorbed",
        IoOperation::ReadCheck,
        0,
        0x10,
    )
    .fault(FaultDefinition::retryable(DeviceOpcode::Read, 3, 0))
    .hypothesis(OutcomeHypothesis::zero().retryable(3));

    let report = runner.run(&case, &target).expect("first run");
    assert_eq!(report.restored_drives, 0);
    let again = runner.run(&case, &target).expect("second run");
    assert_eq!(again.restored_drives, 0);
    assert_eq!(again.completion.counters.get(CounterFamily::Retryable), 3);
    assert!(
        !sim.journal()
            .iter()
            .any(|e| matches!(e, SimEvent::DriveRemoved { .. }))
    );
}

fn fault_for(class: usize, occurrences: u32, position: u32) -> FaultDefinition {
    match class {
        0 => FaultDefinition::retryable(DeviceOpcode::Read, occurrences, position),
        1 => FaultDefinition::non_retryable(DeviceOpcode::Read, occurrences, position),
        2 => FaultDefinition::hard_media(occurrences, position),
        _ => FaultDefinition::soft_media(occurrences, position),
    }
}

fn anything() -> OutcomeHypothesis {
    CounterFamily::ALL
        .iter()
        .fold(OutcomeHypothesis::zero(), |hypothesis, family| {
            hypothesis.with(*family, ExpectedCount::Any)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn ordering_holds_for_any_single_fault(
        class in 0usize..4,
        occurrences in 1u32..24,
        position in 0u32..3,
        watch_drive in any::<bool>(),
    ) {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let config = fast_config();
        let ledger = InjectionLedger::new();
        let runner = ScenarioRunner::new(TargetSystem::from_backend(&sim), &config, &ledger);
        let mut case = ScenarioCase::new(
            "ord-prop",
            "single fault",
            IoOperation::ReadCheck,
            0,
            0x10,
        )
        .fault(fault_for(class, occurrences, position))
        .expecting(1, &[StatusPair::SUCCESS, StatusPair::NOT_RETRYABLE])
        .hypothesis(anything());
        if watch_drive {
            case = case.await_notification(AwaitedNotification {
                target: NotificationTarget::Drive(TargetPosition::Absolute(position)),
                states: LifecycleMask::single(LifecycleState::Fail),
                timing: NotificationTiming::WhileFaulted,
            });
        }

        // Pass or fail, the ordering and cleanup must hold.
        let _ = runner.run(&case, &target);
        let journal = sim.journal();
        assert_ordering(&journal);
        prop_assert!(sim.records().is_empty());
        prop_assert!(!sim.injection_running());
        prop_assert_eq!(ledger.active_sets(), 0);
    }
}
