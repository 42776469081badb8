//! Narrow interfaces to the system under test.
//!
//! The harness never talks to the storage engine directly. Everything it
//! needs goes through these four traits, which keeps the runner testable
//! against [`crate::sim::SimulatedArray`] and lets a real deployment plug in
//! its own control-plane bindings.

use std::fmt;
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use faultline_types::{
    BlockRange, Checkpoint, DeviceOpcode, DriveLocation, IoCompletion, IoOperation, Lba,
    LifecycleMask, LifecycleState, ObjectId, ProtocolErrorClass, TargetPosition, TargetTopology,
};
use serde::{Deserialize, Serialize};

/// Geometry of a raid group as reported by the administration interface.
///
/// All addresses are drive-relative block addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGeometry {
    /// Blocks per element (per-drive stripe unit).
    pub element_size: u32,
    /// Drive address at which raid-protected user data begins.
    pub default_offset: Lba,
    /// Default chunk size used to size user-data fault regions.
    pub default_chunk_size: u64,
    /// Blocks of raid-protected capacity per drive.
    pub raid_protected_capacity: u64,
    /// First block of the paged metadata region.
    pub paged_metadata_start: Lba,
    /// One past the last addressable block of the object.
    pub logical_end: Lba,
    /// Dedicated write-log extent; parity layouts only.
    pub write_log: Option<BlockRange>,
}

/// Parameters of one generated I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRequest {
    pub operation: IoOperation,
    pub lba: Lba,
    pub blocks: u64,
    pub expiration: Option<Duration>,
    pub abort_after: Option<Duration>,
}

/// Handle for an in-flight I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoTicket(pub u64);

/// Armed form of a fault definition, as the injection service sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub object: ObjectId,
    pub opcode: DeviceOpcode,
    pub range: BlockRange,
    pub error_class: ProtocolErrorClass,
    pub occurrences: u32,
    pub group_tag: Option<u32>,
    /// Fire on every drive of the object's raid group, counting occurrences
    /// per drive.
    pub apply_to_all_positions: bool,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "obj={} {} {} x{} range={}",
            self.object, self.error_class, self.opcode, self.occurrences, self.range
        )?;
        if let Some(tag) = self.group_tag {
            write!(f, " tag={tag}")?;
        }
        if self.apply_to_all_positions {
            f.write_str(" all-positions")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Administration / configuration interface of the target.
pub trait AdminService: Send + Sync {
    fn lookup_raid_group(&self, rg_number: u32) -> Result<ObjectId>;

    fn lookup_volume(&self, lun_number: u32) -> Result<ObjectId>;

    fn geometry(&self, raid_group: ObjectId) -> Result<ObjectGeometry>;

    /// Drive object currently occupying `location`, if any.
    fn drive_at(&self, location: DriveLocation) -> Result<Option<ObjectId>>;

    /// Lifecycle state of a live object; `None` once it has been destroyed.
    fn lifecycle_state(&self, object: ObjectId) -> Result<Option<LifecycleState>>;

    /// Force an object toward `state` (used to fail drives).
    fn set_lifecycle_state(&self, object: ObjectId, state: LifecycleState) -> Result<()>;

    fn remove_drive(&self, location: DriveLocation) -> Result<()>;

    fn insert_drive(&self, location: DriveLocation) -> Result<()>;

    fn drive_fault_latched(&self, drive: ObjectId) -> Result<bool>;

    fn clear_drive_fault(&self, drive: ObjectId) -> Result<()>;

    fn background_operations_enabled(&self, drive: ObjectId) -> Result<bool>;

    fn set_background_operations(&self, drive: ObjectId, enabled: bool) -> Result<()>;

    fn service_timeout(&self, drive: ObjectId) -> Result<Duration>;

    fn set_service_timeout(&self, drive: ObjectId, timeout: Duration) -> Result<()>;

    /// Rebuild checkpoint per position, index = position.
    fn rebuild_checkpoints(&self, raid_group: ObjectId) -> Result<Vec<Checkpoint>>;

    /// Checkpoint per outstanding verify type.
    fn verify_checkpoints(&self, raid_group: ObjectId) -> Result<Vec<Checkpoint>>;

    /// Retryable errors the target tolerates before failing one drive.
    fn retry_error_threshold(&self) -> Result<u32>;

    fn default_io_expiration(&self) -> Result<Duration>;

    fn set_default_io_expiration(&self, expiration: Duration) -> Result<()>;
}

/// I/O generation service.
pub trait IoGenerator: Send + Sync {
    fn start_io(&self, target: ObjectId, request: &IoRequest) -> Result<IoTicket>;

    /// Block until the I/O completes, at most `ceiling`.
    fn wait_io(&self, ticket: IoTicket, ceiling: Duration) -> Result<IoCompletion>;
}

/// Fault-injection service intercepting device-protocol exchanges.
pub trait FaultInjectionService: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn add_record(&self, record: &FaultRecord) -> Result<RecordHandle>;

    fn remove_record(&self, handle: RecordHandle) -> Result<()>;

    /// Drop the service's per-drive association for `object`.
    fn remove_object(&self, object: ObjectId) -> Result<()>;

    fn outstanding_records(&self) -> Result<usize>;
}

/// Lifecycle-notification service.
pub trait LifecycleNotifications: Send + Sync {
    fn subscribe(&self, object: ObjectId, states: LifecycleMask) -> Result<SubscriptionId>;

    /// Block until a matching transition is delivered. `Ok(None)` means the
    /// ceiling elapsed first.
    fn wait(&self, subscription: SubscriptionId, ceiling: Duration)
    -> Result<Option<LifecycleState>>;

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()>;
}

/// Borrowed bundle of every external service a runner needs.
#[derive(Clone, Copy)]
pub struct TargetSystem<'a> {
    pub admin: &'a dyn AdminService,
    pub io: &'a dyn IoGenerator,
    pub faults: &'a dyn FaultInjectionService,
    pub notifications: &'a dyn LifecycleNotifications,
}

impl<'a> TargetSystem<'a> {
    /// Bundle a single backend that implements every service.
    pub fn from_backend<B>(backend: &'a B) -> Self
    where
        B: AdminService + IoGenerator + FaultInjectionService + LifecycleNotifications,
    {
        Self {
            admin: backend,
            io: backend,
            faults: backend,
            notifications: backend,
        }
    }
}

impl fmt::Debug for TargetSystem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSystem").finish_non_exhaustive()
    }
}

/// A topology with its raid group, volume and geometry looked up.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub topology: TargetTopology,
    pub raid_group: ObjectId,
    pub volume: ObjectId,
    pub geometry: ObjectGeometry,
}

impl ResolvedTarget {
    pub fn resolve(topology: &TargetTopology, admin: &dyn AdminService) -> Result<Self> {
        let raid_group = admin.lookup_raid_group(topology.rg_number)?;
        let volume = admin.lookup_volume(topology.lun_number)?;
        let geometry = admin.geometry(raid_group)?;
        Ok(Self {
            topology: topology.clone(),
            raid_group,
            volume,
            geometry,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.topology.name
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.topology.width()
    }

    /// Concrete position for `position`; out of range is a setup error
    /// attributed to `source_tag`.
    pub fn position(&self, source_tag: &str, position: TargetPosition) -> Result<u32> {
        position
            .resolve(self.width())
            .ok_or_else(|| HarnessError::InvalidPosition {
                source_tag: source_tag.to_owned(),
                position: position.to_string(),
                width: self.width(),
            })
    }

    pub fn location(&self, source_tag: &str, position: u32) -> Result<DriveLocation> {
        self.topology
            .location(position)
            .ok_or_else(|| HarnessError::InvalidPosition {
                source_tag: source_tag.to_owned(),
                position: position.to_string(),
                width: self.width(),
            })
    }

    /// Drive object currently at `position`.
    pub fn drive(
        &self,
        admin: &dyn AdminService,
        source_tag: &str,
        position: u32,
    ) -> Result<(DriveLocation, ObjectId)> {
        let location = self.location(source_tag, position)?;
        let drive = admin
            .drive_at(location)?
            .ok_or_else(|| HarnessError::not_found(format!("drive at {location}")))?;
        Ok((location, drive))
    }
}
