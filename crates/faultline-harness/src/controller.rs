//! Volume/drive state controller: pre-degrade, restore and quiescence waits.
//!
//! Drive object identity is never assumed stable across a restore. A removed
//! drive is waited out until its object is gone, and the reinserted drive is
//! discovered again by location.

use std::collections::BTreeSet;

use faultline_error::Result;
use faultline_types::{Checkpoint, LifecycleState, ObjectId, ScenarioCase};
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::poll::{PollPolicy, PollStep, poll_until};
use crate::services::{ResolvedTarget, TargetSystem};

#[derive(Debug, Clone, Copy)]
pub struct StateController<'a> {
    services: TargetSystem<'a>,
    state_policy: PollPolicy,
    rebuild_policy: PollPolicy,
    verify_policy: PollPolicy,
}

impl<'a> StateController<'a> {
    #[must_use]
    pub fn new(services: TargetSystem<'a>, config: &HarnessConfig) -> Self {
        Self {
            services,
            state_policy: config.state_policy(),
            rebuild_policy: config.rebuild_policy(),
            verify_policy: config.verify_policy(),
        }
    }

    /// Fail every pre-degraded position of `case` and wait until the raid
    /// group has registered each one for rebuild.
    pub fn degrade(&self, case: &ScenarioCase, target: &ResolvedTarget) -> Result<()> {
        let admin = self.services.admin;
        let tag = case.source_tag.as_str();
        for &position in &case.degraded_positions {
            let (location, drive) = target.drive(admin, tag, position)?;
            admin.set_lifecycle_state(drive, LifecycleState::Fail)?;
            self.await_state(drive, LifecycleState::Fail, &format!("drive {location} to fail"))?;

            let index = usize::try_from(position).unwrap_or(usize::MAX);
            let marker = poll_until(
                &format!("rebuild marker for position {position} of {}", target.name()),
                self.state_policy,
                || {
                    let checkpoints = admin.rebuild_checkpoints(target.raid_group)?;
                    Ok(match checkpoints.get(index).copied() {
                        Some(marker @ Checkpoint::At(_)) => PollStep::Done(marker),
                        other => PollStep::Pending(other),
                    })
                },
            )?;
            info!(
                case = tag,
                target = target.name(),
                position,
                %location,
                %marker,
                "position degraded"
            );
        }
        Ok(())
    }

    /// Cycle every listed position whose drive is not ready or carries a
    /// latched fault. Healthy positions are left alone, so calling this on an
    /// already restored target does nothing. Returns how many drives were
    /// cycled.
    pub fn restore(
        &self,
        source_tag: &str,
        positions: &[u32],
        target: &ResolvedTarget,
    ) -> Result<usize> {
        let admin = self.services.admin;
        let mut cycled = 0;
        for position in positions.iter().copied().collect::<BTreeSet<_>>() {
            let location = target.location(source_tag, position)?;
            let current = admin.drive_at(location)?;
            if let Some(drive) = current {
                let ready = admin.lifecycle_state(drive)? == Some(LifecycleState::Ready);
                if ready && !admin.drive_fault_latched(drive)? {
                    debug!(case = source_tag, position, %drive, "drive healthy, restore skipped");
                    continue;
                }
                admin.remove_drive(location)?;
                let what = format!("drive {drive} at {location} to be destroyed");
                poll_until(&what, self.state_policy, || {
                    let present = admin.drive_at(location)?;
                    let state = admin.lifecycle_state(drive)?;
                    let gone = present != Some(drive)
                        && matches!(state, None | Some(LifecycleState::Destroy));
                    Ok(if gone {
                        PollStep::Done(())
                    } else {
                        PollStep::Pending((present, state))
                    })
                })?;
            }

            admin.insert_drive(location)?;
            let replacement: ObjectId =
                poll_until(&format!("new drive at {location}"), self.state_policy, || {
                    Ok(match admin.drive_at(location)? {
                        Some(drive) if Some(drive) != current => PollStep::Done(drive),
                        other => PollStep::Pending(other),
                    })
                })?;
            if admin.drive_fault_latched(replacement)? {
                admin.clear_drive_fault(replacement)?;
                debug!(case = source_tag, %location, drive = %replacement, "latched fault cleared");
            }
            self.await_state(
                replacement,
                LifecycleState::Ready,
                &format!("drive {replacement} at {location} to become ready"),
            )?;
            info!(
                case = source_tag,
                target = target.name(),
                position,
                old = ?current,
                new = %replacement,
                "drive restored"
            );
            cycled += 1;
        }
        Ok(cycled)
    }

    pub fn await_rebuilds(&self, target: &ResolvedTarget) -> Result<()> {
        let admin = self.services.admin;
        poll_until(&format!("rebuilds on {}", target.name()), self.rebuild_policy, || {
            let checkpoints = admin.rebuild_checkpoints(target.raid_group)?;
            Ok(settled(checkpoints))
        })
    }

    pub fn await_verifies(&self, target: &ResolvedTarget) -> Result<()> {
        let admin = self.services.admin;
        poll_until(&format!("verifies on {}", target.name()), self.verify_policy, || {
            let checkpoints = admin.verify_checkpoints(target.raid_group)?;
            Ok(settled(checkpoints))
        })
    }

    /// Poll `object` until it reports `wanted`.
    pub fn await_state(&self, object: ObjectId, wanted: LifecycleState, what: &str) -> Result<()> {
        let admin = self.services.admin;
        poll_until(what, self.state_policy, || {
            Ok(match admin.lifecycle_state(object)? {
                Some(state) if state == wanted => PollStep::Done(()),
                other => PollStep::Pending(other),
            })
        })
    }
}

fn settled(checkpoints: Vec<Checkpoint>) -> PollStep<(), Vec<Checkpoint>> {
    if checkpoints.iter().all(|checkpoint| !checkpoint.is_pending()) {
        PollStep::Done(())
    } else {
        PollStep::Pending(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::services::{AdminService, FaultInjectionService, FaultRecord, IoGenerator, IoRequest};
    use crate::sim::{SimEvent, SimulatedArray};
    use faultline_error::HarnessError;
    use faultline_types::{
        BlockRange, DeviceOpcode, IoOperation, OutcomeHypothesis, ProtocolErrorClass, TopologyKind,
    };

    fn fast_config() -> HarnessConfig {
        HarnessConfig {
            poll_interval: Duration::from_millis(1),
            state_ceiling: Duration::from_millis(200),
            rebuild_ceiling: Duration::from_millis(200),
            verify_ceiling: Duration::from_millis(200),
            ..HarnessConfig::default()
        }
    }

    fn setup(kind: TopologyKind, width: u32) -> (SimulatedArray, ResolvedTarget) {
        let sim = SimulatedArray::new();
        let topology = sim.add_raid_group("ctl", kind, width);
        let target = ResolvedTarget::resolve(&topology, &sim).expect("resolve");
        (sim, target)
    }

    fn degraded_case(positions: &[u32]) -> ScenarioCase {
        ScenarioCase::new("ctl-001", "degraded read", IoOperation::ReadCheck, 0, 8)
            .degraded(positions)
            .hypothesis(OutcomeHypothesis::zero())
    }

    #[test]
    fn degrade_then_restore_then_rebuild() {
        let (sim, target) = setup(TopologyKind::Raid6, 6);
        let config = fast_config();
        let controller = StateController::new(TargetSystem::from_backend(&sim), &config);
        let case = degraded_case(&[1, 4]);
        let before = target.drive(&sim, "x", 1).expect("drive").1;

        controller.degrade(&case, &target).expect("degrade");
        assert_eq!(sim.lifecycle_state(before).expect("state"), Some(LifecycleState::Fail));

        let cycled = controller
            .restore(&case.source_tag, &case.degraded_positions, &target)
            .expect("restore");
        assert_eq!(cycled, 2);
        let after = target.drive(&sim, "x", 1).expect("drive").1;
        assert_ne!(before, after);
        assert_eq!(sim.lifecycle_state(after).expect("state"), Some(LifecycleState::Ready));

        controller.await_rebuilds(&target).expect("rebuilds finish");
        controller.await_verifies(&target).expect("nothing to verify");
    }

    #[test]
    fn restore_twice_is_a_no_op() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let config = fast_config();
        let controller = StateController::new(TargetSystem::from_backend(&sim), &config);
        assert_eq!(controller.restore("ctl-002", &[0, 1, 2], &target).expect("first"), 0);
        assert_eq!(controller.restore("ctl-002", &[0, 1, 2], &target).expect("second"), 0);
        assert_eq!(controller.restore("ctl-002", &[], &target).expect("empty"), 0);
        assert!(
            !sim.journal()
                .iter()
                .any(|event| matches!(event, SimEvent::DriveRemoved { .. }))
        );
    }

    #[test]
    fn restore_clears_latched_fault_on_replacement() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let config = fast_config();
        let controller = StateController::new(TargetSystem::from_backend(&sim), &config);
        let (location, drive) = target.drive(&sim, "x", 2).expect("drive");
        sim.add_record(&FaultRecord {
            object: drive,
            opcode: DeviceOpcode::Read,
            range: BlockRange::with_len(0x10000, 0x800),
            error_class: ProtocolErrorClass::Retryable,
            occurrences: 12,
            group_tag: None,
            apply_to_all_positions: false,
        })
        .expect("record");
        sim.start().expect("start");
        let ticket = sim
            .start_io(
                target.volume,
                &IoRequest {
                    operation: IoOperation::ReadCheck,
                    lba: 0,
                    blocks: 8,
                    expiration: None,
                    abort_after: None,
                },
            )
            .expect("io");
        sim.wait_io(ticket, Duration::from_secs(1)).expect("wait");
        assert!(sim.drive_fault_latched(drive).expect("latched"));

        assert_eq!(controller.restore("ctl-003", &[2], &target).expect("restore"), 1);
        let replacement = sim.drive_at(location).expect("drive_at").expect("present");
        assert!(!sim.drive_fault_latched(replacement).expect("latched"));
        assert!(sim.journal().iter().any(
            |event| matches!(event, SimEvent::FaultCleared { object } if *object == replacement)
        ));
    }

    #[test]
    fn rebuild_wait_times_out_while_position_is_down() {
        let (sim, target) = setup(TopologyKind::Raid1, 2);
        let config = HarnessConfig {
            rebuild_ceiling: Duration::from_millis(10),
            ..fast_config()
        };
        let controller = StateController::new(TargetSystem::from_backend(&sim), &config);
        controller.degrade(&degraded_case(&[0]), &target).expect("degrade");
        let err = controller.await_rebuilds(&target).expect_err("rebuild cannot progress");
        match err {
            HarnessError::Timeout { what, last_observed, .. } => {
                assert!(what.contains("rebuilds on ctl"), "what={what}");
                assert!(last_observed.contains("At(0)"), "last_observed={last_observed}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn degrade_rejects_position_beyond_width() {
        let (sim, target) = setup(TopologyKind::Raid5, 3);
        let config = fast_config();
        let controller = StateController::new(TargetSystem::from_backend(&sim), &config);
        let err = controller.degrade(&degraded_case(&[3]), &target).expect_err("bad position");
        assert!(matches!(err, HarnessError::InvalidPosition { width: 3, .. }), "err={err}");
    }
}
