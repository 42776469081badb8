//! In-process simulated array implementing every service trait.
//!
//! The model is deliberately coarse. Each volume I/O touches every position
//! of its raid group at the same drive-relative addresses; injected faults
//! consume occurrences as the array "retries"; the outcome depends only on how
//! many positions were lost compared with the layout's redundancy. Rebuild and
//! verify progress advances whenever it is polled. That is enough to exercise
//! every harness path deterministically, including identity churn on drive
//! reinsertion and latched drive faults.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use faultline_error::{HarnessError, Result};
use faultline_types::{
    BlockRange, Checkpoint, DeviceOpcode, DriveLocation, ErrorCounters, IoCompletion,
    IoOperation, IoStatus, LifecycleMask, LifecycleState, ObjectId,
    ProtocolErrorClass, StatusPair, TargetTopology, TopologyKind,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::services::{
    AdminService, FaultInjectionService, FaultRecord, IoGenerator, IoRequest, IoTicket,
    LifecycleNotifications, ObjectGeometry, RecordHandle, SubscriptionId,
};

// ---- profile ----

/// Fixed characteristics of the simulated array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimProfile {
    /// Retryable errors on one drive, within one I/O, that fail the drive.
    pub retry_threshold: u32,
    pub element_size: u32,
    pub default_chunk_size: u64,
    pub default_offset: u64,
    pub raid_protected_capacity: u64,
    pub paged_metadata_blocks: u64,
    pub write_log_blocks: u64,
    /// Simulated time one retry takes; drives expiration and abort.
    pub retry_cost: Duration,
    pub default_expiration: Duration,
    pub default_service_timeout: Duration,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            retry_threshold: 12,
            element_size: 128,
            default_chunk_size: 0x800,
            default_offset: 0x10000,
            raid_protected_capacity: 0x40000,
            paged_metadata_blocks: 0x2000,
            write_log_blocks: 0x400,
            retry_cost: Duration::from_millis(100),
            default_expiration: Duration::from_secs(30),
            default_service_timeout: Duration::from_secs(10),
        }
    }
}

// ---- journal ----

/// Every externally visible call, in the order the array saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Subscribed {
        subscription: SubscriptionId,
        object: ObjectId,
    },
    NotificationDelivered {
        subscription: SubscriptionId,
        state: LifecycleState,
    },
    Unsubscribed {
        subscription: SubscriptionId,
    },
    RecordAdded {
        handle: RecordHandle,
        object: ObjectId,
    },
    RecordRemoved {
        handle: RecordHandle,
    },
    ObjectReleased {
        object: ObjectId,
    },
    InjectionStarted,
    InjectionStopped,
    IoStarted {
        ticket: IoTicket,
        operation: IoOperation,
    },
    IoWaited {
        ticket: IoTicket,
    },
    Transition {
        object: ObjectId,
        state: LifecycleState,
    },
    DriveRemoved {
        location: DriveLocation,
    },
    DriveInserted {
        location: DriveLocation,
        object: ObjectId,
    },
    FaultCleared {
        object: ObjectId,
    },
    BackgroundOps {
        object: ObjectId,
        enabled: bool,
    },
    ServiceTimeout {
        object: ObjectId,
        timeout: Duration,
    },
    ExpirationChanged {
        expiration: Duration,
    },
}

// ---- state ----

#[derive(Debug)]
struct Drive {
    object: ObjectId,
    raid_group: usize,
    state: LifecycleState,
    background_ops: bool,
    service_timeout: Duration,
    /// Port errors took the link down; the drive comes back once the
    /// injection service releases it.
    link_down: bool,
}

#[derive(Debug)]
struct RaidGroup {
    object: ObjectId,
    volume: ObjectId,
    rg_number: u32,
    kind: TopologyKind,
    locations: Vec<DriveLocation>,
    state: LifecycleState,
    volume_state: LifecycleState,
    rebuild: Vec<Checkpoint>,
    /// `[error verify, incomplete-write verify]`.
    verify: [Checkpoint; 2],
    geometry: ObjectGeometry,
}

impl RaidGroup {
    fn width(&self) -> u32 {
        u32::try_from(self.locations.len()).unwrap_or(u32::MAX)
    }

    fn redundancy(&self) -> usize {
        usize::try_from(self.kind.redundancy(self.width())).unwrap_or(usize::MAX)
    }
}

#[derive(Debug)]
struct ArmedRecord {
    record: FaultRecord,
    raid_group: usize,
    remaining: HashMap<ObjectId, u32>,
}

impl ArmedRecord {
    fn remaining_for(&mut self, drive: ObjectId) -> &mut u32 {
        self.remaining
            .entry(drive)
            .or_insert(self.record.occurrences)
    }

    fn covers(&self, drive: ObjectId, raid_group: usize) -> bool {
        self.record.object == drive
            || (self.record.apply_to_all_positions && self.raid_group == raid_group)
    }
}

#[derive(Debug)]
struct Subscription {
    object: ObjectId,
    mask: LifecycleMask,
    delivered: VecDeque<LifecycleState>,
}

#[derive(Debug)]
struct SimState {
    profile: SimProfile,
    next_id: u32,
    next_handle: u64,
    next_ticket: u64,
    next_subscription: u64,
    drives: BTreeMap<DriveLocation, Drive>,
    latched: BTreeSet<DriveLocation>,
    raid_groups: Vec<RaidGroup>,
    records: BTreeMap<RecordHandle, ArmedRecord>,
    injecting: bool,
    completions: HashMap<IoTicket, IoCompletion>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    default_expiration: Duration,
    journal: Vec<SimEvent>,
}

/// Per-position result of one injected error during an I/O.
enum HitOutcome {
    Absorbed,
    Lost,
    FailDrive,
    LinkDown,
}

impl SimState {
    fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            next_id: 0x100,
            next_handle: 1,
            next_ticket: 1,
            next_subscription: 1,
            drives: BTreeMap::new(),
            latched: BTreeSet::new(),
            raid_groups: Vec::new(),
            records: BTreeMap::new(),
            injecting: false,
            completions: HashMap::new(),
            subscriptions: HashMap::new(),
            default_expiration: profile.default_expiration,
            journal: Vec::new(),
        }
    }

    fn allocate(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    fn transition(&mut self, object: ObjectId, state: LifecycleState) {
        trace!(%object, %state, "sim transition");
        self.journal.push(SimEvent::Transition { object, state });
        for subscription in self.subscriptions.values_mut() {
            if subscription.object == object && subscription.mask.contains(state) {
                subscription.delivered.push_back(state);
            }
        }
    }

    fn drive_location(&self, object: ObjectId) -> Result<DriveLocation> {
        self.drives
            .iter()
            .find(|(_, drive)| drive.object == object)
            .map(|(location, _)| *location)
            .ok_or_else(|| HarnessError::not_found(format!("drive {object}")))
    }

    fn drive_mut(&mut self, object: ObjectId) -> Result<&mut Drive> {
        self.drives
            .values_mut()
            .find(|drive| drive.object == object)
            .ok_or_else(|| HarnessError::not_found(format!("drive {object}")))
    }

    fn raid_group_index(&self, object: ObjectId) -> Result<usize> {
        self.raid_groups
            .iter()
            .position(|rg| rg.object == object || rg.volume == object)
            .ok_or_else(|| HarnessError::not_found(format!("raid group or volume {object}")))
    }

    fn position_of(&self, location: DriveLocation) -> Option<(usize, usize)> {
        self.raid_groups.iter().enumerate().find_map(|(index, rg)| {
            rg.locations
                .iter()
                .position(|l| *l == location)
                .map(|position| (index, position))
        })
    }

    fn failed_positions(&self, index: usize) -> usize {
        self.raid_groups[index]
            .locations
            .iter()
            .filter(|location| {
                self.drives
                    .get(*location)
                    .is_none_or(|drive| drive.state != LifecycleState::Ready)
            })
            .count()
    }

    fn mark_rebuild(&mut self, location: DriveLocation) {
        if let Some((index, position)) = self.position_of(location) {
            let marker = &mut self.raid_groups[index].rebuild[position];
            if !marker.is_pending() {
                *marker = Checkpoint::At(0);
            }
        }
    }

    fn fail_drive(&mut self, location: DriveLocation, latch: bool) {
        let Some(drive) = self.drives.get_mut(&location) else {
            return;
        };
        if drive.state == LifecycleState::Fail {
            return;
        }
        drive.state = LifecycleState::Fail;
        let object = drive.object;
        if latch {
            self.latched.insert(location);
        }
        debug!(%location, %object, latch, "sim drive failed");
        self.transition(object, LifecycleState::Fail);
        self.mark_rebuild(location);
    }

    /// Finish pending activations and recompute raid-group health.
    fn settle(&mut self) {
        let activated: Vec<ObjectId> = self
            .drives
            .iter_mut()
            .filter(|(location, drive)| {
                drive.state == LifecycleState::Activate
                    && !drive.link_down
                    && !self.latched.contains(*location)
            })
            .map(|(_, drive)| {
                drive.state = LifecycleState::Ready;
                drive.object
            })
            .collect();
        for object in activated {
            self.transition(object, LifecycleState::Ready);
        }
        for index in 0..self.raid_groups.len() {
            self.refresh_raid_group(index);
        }
    }

    fn refresh_raid_group(&mut self, index: usize) {
        let failed = self.failed_positions(index);
        let rg = &mut self.raid_groups[index];
        let next = if failed > rg.redundancy() {
            LifecycleState::Fail
        } else {
            LifecycleState::Ready
        };
        if rg.state == next {
            return;
        }
        rg.state = next;
        rg.volume_state = next;
        let (object, volume) = (rg.object, rg.volume);
        self.transition(object, next);
        self.transition(volume, next);
    }

    fn add_raid_group(&mut self, name: &str, kind: TopologyKind, width: u32) -> TargetTopology {
        let rg_number = u32::try_from(self.raid_groups.len()).unwrap_or(u32::MAX) + 1;
        let index = self.raid_groups.len();
        let object = self.allocate();
        let volume = self.allocate();
        let profile = self.profile;
        let locations: Vec<DriveLocation> = (0..width)
            .map(|slot| DriveLocation::new(0, rg_number, slot))
            .collect();
        for location in &locations {
            let drive = self.allocate();
            self.drives.insert(
                *location,
                Drive {
                    object: drive,
                    raid_group: index,
                    state: LifecycleState::Ready,
                    background_ops: true,
                    service_timeout: profile.default_service_timeout,
                    link_down: false,
                },
            );
        }
        let paged_metadata_start = profile.default_offset + profile.raid_protected_capacity;
        let geometry = ObjectGeometry {
            element_size: profile.element_size,
            default_offset: profile.default_offset,
            default_chunk_size: profile.default_chunk_size,
            raid_protected_capacity: profile.raid_protected_capacity,
            paged_metadata_start,
            logical_end: paged_metadata_start + profile.paged_metadata_blocks,
            write_log: kind.is_parity().then(|| {
                BlockRange::with_len(
                    profile.default_offset - profile.write_log_blocks,
                    profile.write_log_blocks,
                )
            }),
        };
        self.raid_groups.push(RaidGroup {
            object,
            volume,
            rg_number,
            kind,
            locations: locations.clone(),
            state: LifecycleState::Ready,
            volume_state: LifecycleState::Ready,
            rebuild: vec![Checkpoint::NonePending; locations.len()],
            verify: [Checkpoint::NonePending; 2],
            geometry,
        });
        TargetTopology {
            name: name.to_owned(),
            kind,
            rg_number,
            lun_number: rg_number,
            drive_locations: locations,
        }
    }

    // ---- I/O model ----

    fn touched_ranges(
        &self,
        index: usize,
        opcode: DeviceOpcode,
        request: &IoRequest,
    ) -> Vec<BlockRange> {
        let geometry = &self.raid_groups[index].geometry;
        let mut ranges = vec![BlockRange::with_len(
            geometry.default_offset + request.lba,
            request.blocks,
        )];
        if matches!(opcode, DeviceOpcode::Write | DeviceOpcode::WriteSame) {
            let chunk_index = request.lba / geometry.default_chunk_size.max(1);
            let metadata = (geometry.paged_metadata_start + chunk_index)
                .min(geometry.logical_end.saturating_sub(1));
            ranges.push(BlockRange::with_len(metadata, 1));
            if let Some(log) = geometry.write_log {
                ranges.push(BlockRange::with_len(log.start, 1));
            }
        }
        ranges
    }

    fn simulate_io(&mut self, target: ObjectId, request: &IoRequest) -> Result<IoCompletion> {
        let index = self.raid_group_index(target)?;
        if request.blocks == 0 {
            return Err(HarnessError::service("io", "zero-length request"));
        }
        let mut counters = ErrorCounters::default();
        if self.raid_groups[index].state == LifecycleState::Fail {
            counters.shutdown = 1;
            return Ok(completion(StatusPair::SHUTDOWN, counters));
        }

        let profile = self.profile;
        let expiration = request.expiration.unwrap_or(self.default_expiration);
        let deadline_passed = |clock: Duration| {
            request.abort_after.is_some_and(|abort| clock >= abort) || clock >= expiration
        };

        self.background_collisions(index);

        let locations = self.raid_groups[index].locations.clone();
        let mut clock = Duration::ZERO;
        let mut retries = vec![0_u32; locations.len()];
        let mut lost: BTreeSet<usize> = BTreeSet::new();
        let mut hard_media_hits = 0_u32;
        let mut soft_media_hits = 0_u32;

        for &opcode in request.operation.device_opcodes() {
            let touched = self.touched_ranges(index, opcode, request);
            for (position, location) in locations.iter().enumerate() {
                let Some(drive) = self.drives.get(location) else {
                    lost.insert(position);
                    continue;
                };
                if drive.state != LifecycleState::Ready || lost.contains(&position) {
                    lost.insert(position);
                    continue;
                }
                let drive_object = drive.object;
                let budget = retry_budget(&profile, drive.service_timeout);
                if !self.injecting {
                    continue;
                }
                let hits: Vec<RecordHandle> = self
                    .records
                    .iter()
                    .filter(|(_, armed)| {
                        armed.covers(drive_object, index)
                            && armed.record.opcode == opcode
                            && touched.iter().any(|range| range.intersects(&armed.record.range))
                    })
                    .map(|(handle, _)| *handle)
                    .collect();

                for handle in hits {
                    let outcome = {
                        let Some(armed) = self.records.get_mut(&handle) else {
                            continue;
                        };
                        let class = armed.record.error_class;
                        let remaining = armed.remaining_for(drive_object);
                        match class {
                            ProtocolErrorClass::Retryable | ProtocolErrorClass::PortRetryable => {
                                while *remaining > 0
                                    && retries[position] < budget
                                    && !deadline_passed(clock)
                                {
                                    *remaining -= 1;
                                    retries[position] += 1;
                                    counters.retryable += 1;
                                    clock += profile.retry_cost;
                                }
                                if retries[position] >= profile.retry_threshold {
                                    if class == ProtocolErrorClass::Retryable {
                                        HitOutcome::FailDrive
                                    } else {
                                        HitOutcome::LinkDown
                                    }
                                } else if *remaining > 0 {
                                    // Service timeout or request deadline cut the retries short.
                                    HitOutcome::Lost
                                } else {
                                    HitOutcome::Absorbed
                                }
                            }
                            ProtocolErrorClass::NonRetryable if *remaining > 0 => {
                                *remaining -= 1;
                                counters.non_retryable += 1;
                                if opcode == DeviceOpcode::Read {
                                    HitOutcome::Lost
                                } else {
                                    HitOutcome::FailDrive
                                }
                            }
                            ProtocolErrorClass::HardMedia if *remaining > 0 => {
                                *remaining -= 1;
                                hard_media_hits += 1;
                                HitOutcome::Lost
                            }
                            ProtocolErrorClass::SoftMedia if *remaining > 0 => {
                                *remaining -= 1;
                                soft_media_hits += 1;
                                HitOutcome::Absorbed
                            }
                            _ => HitOutcome::Absorbed,
                        }
                    };
                    match outcome {
                        HitOutcome::Absorbed => continue,
                        HitOutcome::Lost => {}
                        HitOutcome::FailDrive => self.fail_drive(*location, true),
                        HitOutcome::LinkDown => self.take_link_down(*location),
                    }
                    lost.insert(position);
                    break;
                }
            }
        }

        if request.abort_after.is_some_and(|abort| clock >= abort) {
            return Ok(completion(StatusPair::ABORTED, counters));
        }
        if clock >= expiration {
            return Ok(completion(StatusPair::EXPIRED, counters));
        }

        self.refresh_raid_group(index);
        let redundancy = self.raid_groups[index].redundancy();
        let media_blocks =
            u32::try_from(request.blocks.min(u64::from(profile.element_size))).unwrap_or(u32::MAX);
        if self.failed_positions(index) > redundancy {
            counters.shutdown = 1;
            return Ok(completion(StatusPair::SHUTDOWN, counters));
        }
        if lost.len() > redundancy {
            if hard_media_hits > 0 {
                counters.uncorrectable_media = media_blocks * hard_media_hits;
                return Ok(completion(StatusPair::MEDIA_ERROR, counters));
            }
            return Ok(completion(StatusPair::NOT_RETRYABLE, counters));
        }
        let corrected = hard_media_hits + soft_media_hits;
        if corrected > 0 {
            counters.correctable_media = media_blocks * corrected;
            let verify = &mut self.raid_groups[index].verify[0];
            if !verify.is_pending() {
                *verify = Checkpoint::At(0);
            }
        }
        Ok(completion(StatusPair::SUCCESS, counters))
    }

    /// Background media scans hit port faults first unless suspended.
    fn background_collisions(&mut self, index: usize) {
        let scanning: Vec<ObjectId> = self.raid_groups[index]
            .locations
            .iter()
            .filter_map(|location| self.drives.get(location))
            .filter(|drive| drive.background_ops && drive.state == LifecycleState::Ready)
            .map(|drive| drive.object)
            .collect();
        if !self.injecting {
            return;
        }
        for armed in self.records.values_mut() {
            if armed.record.error_class != ProtocolErrorClass::PortRetryable {
                continue;
            }
            for drive in &scanning {
                if armed.covers(*drive, index) {
                    let remaining = armed.remaining_for(*drive);
                    *remaining = remaining.saturating_sub(1);
                }
            }
        }
    }

    fn take_link_down(&mut self, location: DriveLocation) {
        let Some(drive) = self.drives.get_mut(&location) else {
            return;
        };
        drive.link_down = true;
        drive.state = LifecycleState::Activate;
        let object = drive.object;
        debug!(%location, %object, "sim link down");
        self.transition(object, LifecycleState::Activate);
    }
}

fn retry_budget(profile: &SimProfile, service_timeout: Duration) -> u32 {
    if profile.retry_cost.is_zero() {
        return profile.retry_threshold;
    }
    let fits = service_timeout.as_nanos() / profile.retry_cost.as_nanos();
    u32::try_from(fits)
        .unwrap_or(u32::MAX)
        .min(profile.retry_threshold)
}

fn completion(pair: StatusPair, counters: ErrorCounters) -> IoCompletion {
    IoCompletion {
        status: pair.status,
        qualifier: pair.qualifier,
        error_count: u32::from(pair.status != IoStatus::Success),
        counters,
    }
}

// ---- public surface ----

/// Simulated array shared by every runner thread.
#[derive(Debug)]
pub struct SimulatedArray {
    state: Mutex<SimState>,
    changed: Condvar,
}

impl Default for SimulatedArray {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedArray {
    #[must_use]
    pub fn new() -> Self {
        Self::with_profile(SimProfile::default())
    }

    #[must_use]
    pub fn with_profile(profile: SimProfile) -> Self {
        Self {
            state: Mutex::new(SimState::new(profile)),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn profile(&self) -> SimProfile {
        self.state.lock().profile
    }

    /// Create a raid group of `width` fresh drives plus its volume.
    pub fn add_raid_group(&self, name: &str, kind: TopologyKind, width: u32) -> TargetTopology {
        let mut state = self.state.lock();
        let topology = state.add_raid_group(name, kind, width);
        debug!(name, %kind, width, rg = topology.rg_number, "sim raid group created");
        topology
    }

    /// Currently armed records, in handle order.
    #[must_use]
    pub fn records(&self) -> Vec<FaultRecord> {
        self.state
            .lock()
            .records
            .values()
            .map(|armed| armed.record.clone())
            .collect()
    }

    #[must_use]
    pub fn injection_running(&self) -> bool {
        self.state.lock().injecting
    }

    #[must_use]
    pub fn journal(&self) -> Vec<SimEvent> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn locked<T>(&self, op: impl FnOnce(&mut SimState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        state.settle();
        let result = op(&mut *state);
        drop(state);
        self.changed.notify_all();
        result
    }
}

impl AdminService for SimulatedArray {
    fn lookup_raid_group(&self, rg_number: u32) -> Result<ObjectId> {
        self.locked(|state| {
            state
                .raid_groups
                .iter()
                .find(|rg| rg.rg_number == rg_number)
                .map(|rg| rg.object)
                .ok_or_else(|| HarnessError::not_found(format!("raid group {rg_number}")))
        })
    }

    fn lookup_volume(&self, lun_number: u32) -> Result<ObjectId> {
        self.locked(|state| {
            state
                .raid_groups
                .iter()
                .find(|rg| rg.rg_number == lun_number)
                .map(|rg| rg.volume)
                .ok_or_else(|| HarnessError::not_found(format!("volume {lun_number}")))
        })
    }

    fn geometry(&self, raid_group: ObjectId) -> Result<ObjectGeometry> {
        self.locked(|state| {
            let index = state.raid_group_index(raid_group)?;
            Ok(state.raid_groups[index].geometry)
        })
    }

    fn drive_at(&self, location: DriveLocation) -> Result<Option<ObjectId>> {
        self.locked(|state| Ok(state.drives.get(&location).map(|drive| drive.object)))
    }

    fn lifecycle_state(&self, object: ObjectId) -> Result<Option<LifecycleState>> {
        self.locked(|state| {
            if let Some(drive) = state.drives.values().find(|drive| drive.object == object) {
                return Ok(Some(drive.state));
            }
            Ok(state.raid_groups.iter().find_map(|rg| {
                if rg.object == object {
                    Some(rg.state)
                } else if rg.volume == object {
                    Some(rg.volume_state)
                } else {
                    None
                }
            }))
        })
    }

    fn set_lifecycle_state(&self, object: ObjectId, target: LifecycleState) -> Result<()> {
        self.locked(|state| {
            if let Ok(location) = state.drive_location(object) {
                if target == LifecycleState::Fail {
                    state.fail_drive(location, false);
                } else {
                    state.drive_mut(object)?.state = target;
                    state.transition(object, target);
                }
                return Ok(());
            }
            Err(HarnessError::service(
                "admin",
                format!("cannot force {object} to {target}: not a drive"),
            ))
        })
    }

    fn remove_drive(&self, location: DriveLocation) -> Result<()> {
        self.locked(|state| {
            let drive = state
                .drives
                .remove(&location)
                .ok_or_else(|| HarnessError::not_found(format!("drive at {location}")))?;
            state.journal.push(SimEvent::DriveRemoved { location });
            state.transition(drive.object, LifecycleState::Destroy);
            state.mark_rebuild(location);
            state.refresh_raid_group(drive.raid_group);
            Ok(())
        })
    }

    fn insert_drive(&self, location: DriveLocation) -> Result<()> {
        self.locked(|state| {
            if state.drives.contains_key(&location) {
                return Err(HarnessError::service("admin", format!("slot {location} is occupied")));
            }
            let (raid_group, _) = state
                .position_of(location)
                .ok_or_else(|| HarnessError::not_found(format!("slot {location}")))?;
            let object = state.allocate();
            let service_timeout = state.profile.default_service_timeout;
            state.drives.insert(
                location,
                Drive {
                    object,
                    raid_group,
                    state: LifecycleState::Activate,
                    background_ops: true,
                    service_timeout,
                    link_down: false,
                },
            );
            state.journal.push(SimEvent::DriveInserted { location, object });
            state.transition(object, LifecycleState::Activate);
            Ok(())
        })
    }

    fn drive_fault_latched(&self, drive: ObjectId) -> Result<bool> {
        self.locked(|state| {
            let location = state.drive_location(drive)?;
            Ok(state.latched.contains(&location))
        })
    }

    fn clear_drive_fault(&self, drive: ObjectId) -> Result<()> {
        self.locked(|state| {
            let location = state.drive_location(drive)?;
            state.latched.remove(&location);
            state.journal.push(SimEvent::FaultCleared { object: drive });
            Ok(())
        })
    }

    fn background_operations_enabled(&self, drive: ObjectId) -> Result<bool> {
        self.locked(|state| Ok(state.drive_mut(drive)?.background_ops))
    }

    fn set_background_operations(&self, drive: ObjectId, enabled: bool) -> Result<()> {
        self.locked(|state| {
            state.drive_mut(drive)?.background_ops = enabled;
            state.journal.push(SimEvent::BackgroundOps {
                object: drive,
                enabled,
            });
            Ok(())
        })
    }

    fn service_timeout(&self, drive: ObjectId) -> Result<Duration> {
        self.locked(|state| Ok(state.drive_mut(drive)?.service_timeout))
    }

    fn set_service_timeout(&self, drive: ObjectId, timeout: Duration) -> Result<()> {
        self.locked(|state| {
            state.drive_mut(drive)?.service_timeout = timeout;
            state.journal.push(SimEvent::ServiceTimeout {
                object: drive,
                timeout,
            });
            Ok(())
        })
    }

    fn rebuild_checkpoints(&self, raid_group: ObjectId) -> Result<Vec<Checkpoint>> {
        self.locked(|state| {
            let index = state.raid_group_index(raid_group)?;
            let step = (state.profile.raid_protected_capacity / 4).max(1);
            let capacity = state.profile.raid_protected_capacity;
            let ready: Vec<bool> = state.raid_groups[index]
                .locations
                .iter()
                .map(|location| {
                    state
                        .drives
                        .get(location)
                        .is_some_and(|drive| drive.state == LifecycleState::Ready)
                })
                .collect();
            let rg = &mut state.raid_groups[index];
            for (marker, drive_ready) in rg.rebuild.iter_mut().zip(ready) {
                if let Checkpoint::At(at) = *marker {
                    if drive_ready {
                        let next = at + step;
                        *marker = if next >= capacity {
                            Checkpoint::NonePending
                        } else {
                            Checkpoint::At(next)
                        };
                    }
                }
            }
            Ok(rg.rebuild.clone())
        })
    }

    fn verify_checkpoints(&self, raid_group: ObjectId) -> Result<Vec<Checkpoint>> {
        self.locked(|state| {
            let index = state.raid_group_index(raid_group)?;
            let step = (state.profile.raid_protected_capacity / 2).max(1);
            let capacity = state.profile.raid_protected_capacity;
            let rg = &mut state.raid_groups[index];
            for marker in &mut rg.verify {
                if let Checkpoint::At(at) = *marker {
                    let next = at + step;
                    *marker = if next >= capacity {
                        Checkpoint::NonePending
                    } else {
                        Checkpoint::At(next)
                    };
                }
            }
            Ok(rg.verify.to_vec())
        })
    }

    fn retry_error_threshold(&self) -> Result<u32> {
        Ok(self.state.lock().profile.retry_threshold)
    }

    fn default_io_expiration(&self) -> Result<Duration> {
        Ok(self.state.lock().default_expiration)
    }

    fn set_default_io_expiration(&self, expiration: Duration) -> Result<()> {
        self.locked(|state| {
            state.default_expiration = expiration;
            state.journal.push(SimEvent::ExpirationChanged { expiration });
            Ok(())
        })
    }
}

impl IoGenerator for SimulatedArray {
    fn start_io(&self, target: ObjectId, request: &IoRequest) -> Result<IoTicket> {
        self.locked(|state| {
            let ticket = IoTicket(state.next_ticket);
            state.next_ticket += 1;
            state.journal.push(SimEvent::IoStarted {
                ticket,
                operation: request.operation,
            });
            let completion = state.simulate_io(target, request)?;
            debug!(
                ticket = ticket.0,
                %target,
                operation = %request.operation,
                lba = request.lba,
                blocks = request.blocks,
                %completion,
                "sim io completed"
            );
            state.completions.insert(ticket, completion);
            Ok(ticket)
        })
    }

    fn wait_io(&self, ticket: IoTicket, _ceiling: Duration) -> Result<IoCompletion> {
        self.locked(|state| {
            let completion = state.completions.remove(&ticket).ok_or_else(|| {
                HarnessError::service("io", format!("unknown ticket {}", ticket.0))
            })?;
            state.journal.push(SimEvent::IoWaited { ticket });
            Ok(completion)
        })
    }
}

impl FaultInjectionService for SimulatedArray {
    fn start(&self) -> Result<()> {
        self.locked(|state| {
            state.injecting = true;
            state.journal.push(SimEvent::InjectionStarted);
            Ok(())
        })
    }

    fn stop(&self) -> Result<()> {
        self.locked(|state| {
            state.injecting = false;
            state.journal.push(SimEvent::InjectionStopped);
            Ok(())
        })
    }

    fn add_record(&self, record: &FaultRecord) -> Result<RecordHandle> {
        self.locked(|state| {
            if record.occurrences == 0 {
                return Err(HarnessError::service("fault", "record with zero occurrences"));
            }
            let location = state.drive_location(record.object)?;
            let (raid_group, _) = state
                .position_of(location)
                .ok_or_else(|| HarnessError::not_found(format!("slot {location}")))?;
            let handle = RecordHandle(state.next_handle);
            state.next_handle += 1;
            state.records.insert(
                handle,
                ArmedRecord {
                    record: record.clone(),
                    raid_group,
                    remaining: HashMap::new(),
                },
            );
            state.journal.push(SimEvent::RecordAdded {
                handle,
                object: record.object,
            });
            Ok(handle)
        })
    }

    fn remove_record(&self, handle: RecordHandle) -> Result<()> {
        self.locked(|state| {
            state.records.remove(&handle).ok_or_else(|| {
                HarnessError::service("fault", format!("unknown record {}", handle.0))
            })?;
            state.journal.push(SimEvent::RecordRemoved { handle });
            Ok(())
        })
    }

    fn remove_object(&self, object: ObjectId) -> Result<()> {
        self.locked(|state| {
            if let Ok(drive) = state.drive_mut(object) {
                drive.link_down = false;
            }
            state.journal.push(SimEvent::ObjectReleased { object });
            // Bring a bounced link back without waiting for the next call.
            state.settle();
            Ok(())
        })
    }

    fn outstanding_records(&self) -> Result<usize> {
        Ok(self.state.lock().records.len())
    }
}

impl LifecycleNotifications for SimulatedArray {
    fn subscribe(&self, object: ObjectId, states: LifecycleMask) -> Result<SubscriptionId> {
        self.locked(|state| {
            let subscription = SubscriptionId(state.next_subscription);
            state.next_subscription += 1;
            state.subscriptions.insert(
                subscription,
                Subscription {
                    object,
                    mask: states,
                    delivered: VecDeque::new(),
                },
            );
            state.journal.push(SimEvent::Subscribed {
                subscription,
                object,
            });
            Ok(subscription)
        })
    }

    fn wait(
        &self,
        subscription: SubscriptionId,
        ceiling: Duration,
    ) -> Result<Option<LifecycleState>> {
        let deadline = Instant::now() + ceiling;
        let mut state = self.state.lock();
        loop {
            state.settle();
            let delivered = state
                .subscriptions
                .get_mut(&subscription)
                .ok_or_else(|| {
                    HarnessError::service(
                        "notification",
                        format!("unknown subscription {}", subscription.0),
                    )
                })?
                .delivered
                .pop_front();
            if let Some(delivered) = delivered {
                state.journal.push(SimEvent::NotificationDelivered {
                    subscription,
                    state: delivered,
                });
                return Ok(Some(delivered));
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        self.locked(|state| {
            state.subscriptions.remove(&subscription);
            state.journal.push(SimEvent::Unsubscribed { subscription });
            Ok(())
        })
    }
}
