//! Fault injector adapter: turns a case's fault definitions into armed
//! records on the fault-injection service and owns their teardown.
//!
//! Arming returns an [`ArmedFaults`] guard. Everything it changed on the
//! target (records, per-drive associations, background operations, service
//! timeouts) is undone by [`ArmedFaults::disarm`], or best-effort on drop if
//! the runner bailed out before reaching the disarm phase.

use std::collections::HashMap;
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use faultline_types::{
    BlockRange, DriveLocation, FaultDefinition, FaultRegion, ObjectId, ScenarioCase,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::services::{FaultRecord, ObjectGeometry, RecordHandle, ResolvedTarget, TargetSystem};

/// Drive-relative block range a fault in `region` covers.
pub fn region_range(
    region: FaultRegion,
    geometry: &ObjectGeometry,
    object: ObjectId,
) -> Result<BlockRange> {
    let chunk = geometry.default_chunk_size;
    let geometry_error = |detail: &str| HarnessError::Geometry {
        object: object.get(),
        detail: detail.to_owned(),
    };
    match region {
        FaultRegion::UserData => Ok(BlockRange::with_len(geometry.default_offset, chunk)),
        FaultRegion::UserDataSecondaryChunk => {
            Ok(BlockRange::with_len(geometry.default_offset + chunk, chunk))
        }
        FaultRegion::PagedMetadata => {
            if geometry.logical_end <= geometry.paged_metadata_start {
                return Err(geometry_error("paged metadata region is empty"));
            }
            Ok(BlockRange::with_len(
                geometry.paged_metadata_start,
                geometry.logical_end - geometry.paged_metadata_start,
            ))
        }
        FaultRegion::AllRaidProtected => Ok(BlockRange::with_len(
            geometry.default_offset,
            geometry.raid_protected_capacity,
        )),
        FaultRegion::WriteLog => geometry
            .write_log
            .ok_or_else(|| geometry_error("no write log extent for this layout")),
    }
}

/// Harness-side state shared by every injector driving the same system.
///
/// Injection start/stop is global on the service, so the ledger counts armed
/// sets and only stops injection once the last one is torn down. It also
/// keeps the background-operation setting found on each drive slot before the
/// harness first suspended it. The first capture per slot is authoritative;
/// later arms re-read the setting and treat a disagreement as an integrity
/// fault, since somebody other than the harness changed it.
#[derive(Debug, Default)]
pub struct InjectionLedger {
    captured: Mutex<HashMap<DriveLocation, bool>>,
    active_sets: Mutex<usize>,
}

impl InjectionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn captured(&self, location: DriveLocation) -> Option<bool> {
        self.captured.lock().get(&location).copied()
    }

    #[must_use]
    pub fn active_sets(&self) -> usize {
        *self.active_sets.lock()
    }

    fn begin_injection(&self, services: TargetSystem<'_>) -> Result<()> {
        let mut active = self.active_sets.lock();
        services.faults.start()?;
        *active += 1;
        Ok(())
    }

    fn end_injection(&self, services: TargetSystem<'_>) -> Result<()> {
        let mut active = self.active_sets.lock();
        *active = active.saturating_sub(1);
        if *active > 0 {
            debug!(active = *active, "injection left running for other armed sets");
            return Ok(());
        }
        match services.faults.outstanding_records()? {
            0 => services.faults.stop(),
            remaining => {
                debug!(remaining, "injection left running for foreign records");
                Ok(())
            }
        }
    }

    fn suspend(
        &self,
        services: TargetSystem<'_>,
        location: DriveLocation,
        drive: ObjectId,
    ) -> Result<()> {
        let current = services.admin.background_operations_enabled(drive)?;
        {
            let mut captured = self.captured.lock();
            match captured.get(&location) {
                Some(&prior) if prior != current => {
                    return Err(HarnessError::integrity(format!(
                        "background operations on {location} read {current}, ledger holds {prior}"
                    )));
                }
                Some(_) => {}
                None => {
                    captured.insert(location, current);
                }
            }
        }
        debug!(%location, %drive, prior = current, "suspending background operations");
        services.admin.set_background_operations(drive, false)
    }

    fn restore(
        &self,
        services: TargetSystem<'_>,
        location: DriveLocation,
        drive: ObjectId,
    ) -> Result<()> {
        let Some(prior) = self.captured(location) else {
            return Err(HarnessError::integrity(format!(
                "no captured background-operation setting for {location}"
            )));
        };
        services.admin.set_background_operations(drive, prior)
    }
}

/// Arms fault definitions against one target.
#[derive(Debug, Clone, Copy)]
pub struct FaultInjector<'a> {
    services: TargetSystem<'a>,
    ledger: &'a InjectionLedger,
    short_service_timeout: Duration,
}

impl<'a> FaultInjector<'a> {
    #[must_use]
    pub const fn new(
        services: TargetSystem<'a>,
        ledger: &'a InjectionLedger,
        short_service_timeout: Duration,
    ) -> Self {
        Self {
            services,
            ledger,
            short_service_timeout,
        }
    }

    /// Arm every fault of `case` on `target` and start injection.
    ///
    /// On error, whatever was armed so far is torn down by the partially
    /// built guard's drop.
    pub fn arm(&self, case: &ScenarioCase, target: &ResolvedTarget) -> Result<ArmedFaults<'a>> {
        let tag = case.source_tag.as_str();
        if case.has_port_fault() && case.faults.len() != 1 {
            return Err(HarnessError::invalid_scenario(
                tag,
                format!(
                    "port-level fault must be the only definition, found {}",
                    case.faults.len()
                ),
            ));
        }

        let mut armed = ArmedFaults {
            services: self.services,
            ledger: self.ledger,
            source_tag: case.source_tag.clone(),
            handles: Vec::new(),
            drives: Vec::new(),
            suspended: Vec::new(),
            timeouts: Vec::new(),
            injecting: false,
            disarmed: false,
        };

        for fault in &case.faults {
            let position = target.position(tag, fault.position)?;
            self.arm_one(case, target, fault, position, &mut armed)?;
        }

        if !armed.handles.is_empty() {
            self.ledger.begin_injection(self.services)?;
            armed.injecting = true;
        }
        info!(
            case = tag,
            target = target.name(),
            records = armed.handles.len(),
            drives = armed.drives.len(),
            "faults armed"
        );
        Ok(armed)
    }

    fn arm_one(
        &self,
        case: &ScenarioCase,
        target: &ResolvedTarget,
        fault: &FaultDefinition,
        position: u32,
        armed: &mut ArmedFaults<'a>,
    ) -> Result<()> {
        let tag = case.source_tag.as_str();
        let (location, drive) = target.drive(self.services.admin, tag, position)?;
        let range = region_range(fault.region, &target.geometry, target.raid_group)?;
        let first_touch = !armed.drives.iter().any(|(_, d)| *d == drive);

        if first_touch {
            armed.drives.push((location, drive));
            if case.service_timeout_override {
                let previous = self.services.admin.service_timeout(drive)?;
                self.services
                    .admin
                    .set_service_timeout(drive, self.short_service_timeout)?;
                armed.timeouts.push((drive, previous));
                debug!(case = tag, %drive, ?previous, "service timeout shortened");
            }
        }
        if fault.error_class.is_port_level() && !armed.suspended.iter().any(|(_, d)| *d == drive) {
            self.ledger.suspend(self.services, location, drive)?;
            armed.suspended.push((location, drive));
        }

        let record = FaultRecord {
            object: drive,
            opcode: fault.opcode,
            range,
            error_class: fault.error_class,
            occurrences: fault.occurrences,
            group_tag: fault.group_tag,
            apply_to_all_positions: case.apply_fault_across_all_positions,
        };
        let handle = self
            .services
            .faults
            .add_record(&record)
            .map_err(|err| HarnessError::fault_record("create", format!("{record}: {err}")))?;
        debug!(case = tag, position, %record, "fault record created");
        armed.handles.push(handle);
        Ok(())
    }
}

/// Records and drive settings held for one case.
#[derive(Debug)]
pub struct ArmedFaults<'a> {
    services: TargetSystem<'a>,
    ledger: &'a InjectionLedger,
    source_tag: String,
    handles: Vec<RecordHandle>,
    drives: Vec<(DriveLocation, ObjectId)>,
    suspended: Vec<(DriveLocation, ObjectId)>,
    timeouts: Vec<(ObjectId, Duration)>,
    injecting: bool,
    disarmed: bool,
}

impl ArmedFaults<'_> {
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.handles.len()
    }

    /// Tear everything down. Every step is attempted; the first failure is
    /// returned.
    pub fn disarm(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.disarmed {
            return Ok(());
        }
        self.disarmed = true;
        let mut first_error: Option<HarnessError> = None;
        let mut keep = |result: Result<()>| {
            if let Err(err) = result {
                warn!(case = %self.source_tag, error = %err, "disarm step failed");
                first_error.get_or_insert(err);
            }
        };

        for handle in self.handles.drain(..) {
            keep(
                self.services
                    .faults
                    .remove_record(handle)
                    .map_err(|err| HarnessError::fault_record("remove", err.to_string())),
            );
        }
        for (_, drive) in &self.drives {
            keep(self.services.faults.remove_object(*drive));
        }
        if self.injecting {
            self.injecting = false;
            keep(self.ledger.end_injection(self.services));
        }
        for (location, drive) in self.suspended.drain(..) {
            keep(self.ledger.restore(self.services, location, drive));
        }
        for (drive, previous) in self.timeouts.drain(..) {
            keep(self.services.admin.set_service_timeout(drive, previous));
        }

        debug!(case = %self.source_tag, "faults disarmed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ArmedFaults<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            warn!(case = %self.source_tag, "armed faults dropped without disarm");
            let _ = self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::AdminService;
    use crate::sim::{SimEvent, SimulatedArray};
    use faultline_types::{DeviceOpcode, IoOperation, OutcomeHypothesis, TopologyKind};

    fn setup(kind: TopologyKind, width: u32) -> (SimulatedArray, ResolvedTarget) {
        let sim = SimulatedArray::new();
        let topology = sim.add_raid_group("t", kind, width);
        let target = ResolvedTarget::resolve(&topology, &sim).expect("resolve");
        (sim, target)
    }

    fn injector_for<'a>(sim: &'a SimulatedArray, ledger: &'a InjectionLedger) -> FaultInjector<'a> {
        FaultInjector::new(TargetSystem::from_backend(sim), ledger, Duration::from_millis(10))
    }

    fn case_with(fault: FaultDefinition) -> ScenarioCase {
        ScenarioCase::new("inj-001", "injector", IoOperation::ReadCheck, 0, 8)
            .fault(fault)
            .hypothesis(OutcomeHypothesis::zero())
    }

    #[test]
    fn regions_follow_geometry() {
        let geometry = ObjectGeometry {
            element_size: 128,
            default_offset: 0x10000,
            default_chunk_size: 0x800,
            raid_protected_capacity: 0x20000,
            paged_metadata_start: 0x2f000,
            logical_end: 0x30000,
            write_log: None,
        };
        let obj = ObjectId(9);
        assert_eq!(
            region_range(FaultRegion::UserData, &geometry, obj).expect("user"),
            BlockRange::with_len(0x10000, 0x800)
        );
        assert_eq!(
            region_range(FaultRegion::UserDataSecondaryChunk, &geometry, obj).expect("second"),
            BlockRange::with_len(0x10800, 0x800)
        );
        assert_eq!(
            region_range(FaultRegion::PagedMetadata, &geometry, obj).expect("paged"),
            BlockRange::with_len(0x2f000, 0x1000)
        );
        assert_eq!(
            region_range(FaultRegion::AllRaidProtected, &geometry, obj).expect("all"),
            BlockRange::with_len(0x10000, 0x20000)
        );
        let err = region_range(FaultRegion::WriteLog, &geometry, obj).expect_err("no log");
        assert!(matches!(err, HarnessError::Geometry { object: 9, .. }));
    }

    #[test]
    fn out_of_range_position_is_setup_error() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::retryable(DeviceOpcode::Read, 1, 0).from_last(3));
        let err = injector.arm(&case, &target).expect_err("position out of range");
        assert!(matches!(err, HarnessError::InvalidPosition { width: 3, .. }), "err={err}");
    }

    #[test]
    fn from_last_targets_last_drive() {
        let (sim, target) = setup(TopologyKind::Raid5, 5);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::retryable(DeviceOpcode::Read, 2, 0).from_last(0));
        let armed = injector.arm(&case, &target).expect("arm");
        let last = target.drive(&sim, "x", 4).expect("drive").1;
        let records = sim.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object, last);
        armed.disarm().expect("disarm");
        assert!(sim.records().is_empty());
        assert!(!sim.injection_running());
    }

    #[test]
    fn injection_stops_only_after_last_armed_set() {
        let sim = SimulatedArray::new();
        let first = sim.add_raid_group("a", TopologyKind::Raid5, 3);
        let first = ResolvedTarget::resolve(&first, &sim).expect("a");
        let second = sim.add_raid_group("b", TopologyKind::Raid1, 2);
        let second = ResolvedTarget::resolve(&second, &sim).expect("b");
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::retryable(DeviceOpcode::Read, 2, 0));

        let armed_a = injector.arm(&case, &first).expect("arm a");
        let armed_b = injector.arm(&case, &second).expect("arm b");
        assert_eq!(ledger.active_sets(), 2);
        armed_a.disarm().expect("disarm a");
        assert!(sim.injection_running());
        assert_eq!(sim.records().len(), 1);
        armed_b.disarm().expect("disarm b");
        assert!(!sim.injection_running());
        assert_eq!(ledger.active_sets(), 0);
    }

    #[test]
    fn all_positions_flag_reaches_the_record() {
        let (sim, target) = setup(TopologyKind::Raid6, 6);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::soft_media(1, 0)).all_positions();
        let armed = injector.arm(&case, &target).expect("arm");
        assert_eq!(armed.record_count(), 1);
        assert!(sim.records()[0].apply_to_all_positions);
        armed.disarm().expect("disarm");
    }

    #[test]
    fn port_fault_suspends_and_restores_background_ops() {
        let (sim, target) = setup(TopologyKind::Raid1, 2);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::port_retryable(DeviceOpcode::Read, 2, 1));
        let (location, drive) = target.drive(&sim, "x", 1).expect("drive");

        let armed = injector.arm(&case, &target).expect("arm");
        assert_eq!(ledger.captured(location), Some(true));
        assert!(!sim.background_operations_enabled(drive).expect("read"));
        armed.disarm().expect("disarm");
        assert!(sim.background_operations_enabled(drive).expect("read"));
    }

    #[test]
    fn ledger_mismatch_is_integrity_fault() {
        let (sim, target) = setup(TopologyKind::Raid1, 2);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::port_retryable(DeviceOpcode::Read, 2, 0));
        injector.arm(&case, &target).expect("arm").disarm().expect("disarm");

        let (_, drive) = target.drive(&sim, "x", 0).expect("drive");
        sim.set_background_operations(drive, false).expect("flip");
        let err = injector.arm(&case, &target).expect_err("mismatch");
        assert!(matches!(err, HarnessError::Integrity { .. }), "err={err}");
    }

    #[test]
    fn port_fault_with_companions_is_rejected() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::port_retryable(DeviceOpcode::Read, 2, 0))
            .fault(FaultDefinition::retryable(DeviceOpcode::Read, 1, 1));
        let err = injector.arm(&case, &target).expect_err("reject");
        assert!(matches!(err, HarnessError::InvalidScenario { .. }));
        assert!(sim.records().is_empty());
    }

    #[test]
    fn service_timeout_is_overridden_then_restored() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let ledger = InjectionLedger::new();
        let short = Duration::from_millis(40);
        let injector = FaultInjector::new(TargetSystem::from_backend(&sim), &ledger, short);
        let case =
            case_with(FaultDefinition::retryable(DeviceOpcode::Read, 1, 2)).short_service_timeout();
        let (_, drive) = target.drive(&sim, "x", 2).expect("drive");
        let before = sim.service_timeout(drive).expect("timeout");

        let armed = injector.arm(&case, &target).expect("arm");
        assert_eq!(sim.service_timeout(drive).expect("timeout"), short);
        armed.disarm().expect("disarm");
        assert_eq!(sim.service_timeout(drive).expect("timeout"), before);
    }

    #[test]
    fn drop_without_disarm_cleans_up() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(FaultDefinition::non_retryable(DeviceOpcode::Write, 1, 1));
        {
            let _armed = injector.arm(&case, &target).expect("arm");
            assert_eq!(sim.records().len(), 1);
        }
        assert!(sim.records().is_empty());
        assert!(sim
            .journal()
            .iter()
            .any(|event| matches!(event, SimEvent::InjectionStopped)));
    }

    #[test]
    fn write_log_region_requires_parity_layout() {
        let (sim, target) = setup(TopologyKind::Raid1, 2);
        let ledger = InjectionLedger::new();
        let injector = injector_for(&sim, &ledger);
        let case = case_with(
            FaultDefinition::retryable(DeviceOpcode::Write, 1, 0).in_region(FaultRegion::WriteLog),
        );
        assert!(matches!(
            injector.arm(&case, &target),
            Err(HarnessError::Geometry { .. })
        ));
    }
}
