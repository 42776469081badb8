//! Fault definitions: the declarative form of one injected protocol error.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of protocol error, mapped to a concrete device status by the
/// fault-injection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorClass {
    Retryable,
    /// Retryable error raised by the port rather than the drive. Not
    /// address-scoped on the target side.
    PortRetryable,
    NonRetryable,
    HardMedia,
    SoftMedia,
}

impl ProtocolErrorClass {
    #[must_use]
    pub const fn is_port_level(self) -> bool {
        matches!(self, Self::PortRetryable)
    }

    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::HardMedia | Self::SoftMedia)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::PortRetryable => "port_retryable",
            Self::NonRetryable => "non_retryable",
            Self::HardMedia => "hard_media",
            Self::SoftMedia => "soft_media",
        }
    }
}

impl fmt::Display for ProtocolErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Device-level operation an injected fault intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOpcode {
    Read,
    Write,
    WriteSame,
}

impl fmt::Display for DeviceOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::WriteSame => "WRITE_SAME",
        };
        f.write_str(name)
    }
}

/// Which drive of the raid group a fault targets.
///
/// `FromLast(n)` counts back from the last position so one case stays
/// portable across topology widths: `FromLast(0)` is position `width - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPosition {
    Absolute(u32),
    FromLast(u32),
}

impl TargetPosition {
    /// Concrete position for `width`, or `None` when it falls outside.
    #[must_use]
    pub const fn resolve(self, width: u32) -> Option<u32> {
        match self {
            Self::Absolute(position) if position < width => Some(position),
            Self::FromLast(back) if back < width => Some(width - 1 - back),
            Self::Absolute(_) | Self::FromLast(_) => None,
        }
    }
}

impl fmt::Display for TargetPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(position) => write!(f, "{position}"),
            Self::FromLast(0) => f.write_str("last"),
            Self::FromLast(back) => write!(f, "last-{back}"),
        }
    }
}

/// Address region of the target drive an injected fault covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultRegion {
    /// First default-sized chunk of user data.
    UserData,
    /// The chunk right after [`Self::UserData`].
    UserDataSecondaryChunk,
    /// Paged metadata, from its start to the object's logical end.
    PagedMetadata,
    /// The whole raid-protected extent.
    AllRaidProtected,
    /// The parity write log's reserved extent.
    WriteLog,
}

impl fmt::Display for FaultRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UserData => "user_data",
            Self::UserDataSecondaryChunk => "user_data_secondary",
            Self::PagedMetadata => "paged_metadata",
            Self::AllRaidProtected => "all_raid_protected",
            Self::WriteLog => "write_log",
        };
        f.write_str(name)
    }
}

/// One synthetic protocol error to inject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDefinition {
    pub error_class: ProtocolErrorClass,
    pub opcode: DeviceOpcode,
    /// How many times the record fires before it goes inert.
    pub occurrences: u32,
    pub position: TargetPosition,
    /// The drive is expected to be failed by the target as a result, and
    /// must be restored after the case.
    pub causes_device_failure: bool,
    pub region: FaultRegion,
    #[serde(default)]
    pub group_tag: Option<u32>,
}

impl FaultDefinition {
    /// User-data fault on an absolute position that leaves the drive alive.
    #[must_use]
    pub const fn new(
        error_class: ProtocolErrorClass,
        opcode: DeviceOpcode,
        occurrences: u32,
        position: TargetPosition,
    ) -> Self {
        Self {
            error_class,
            opcode,
            occurrences,
            position,
            causes_device_failure: false,
            region: FaultRegion::UserData,
            group_tag: None,
        }
    }

    #[must_use]
    pub const fn retryable(opcode: DeviceOpcode, occurrences: u32, position: u32) -> Self {
        Self::new(
            ProtocolErrorClass::Retryable,
            opcode,
            occurrences,
            TargetPosition::Absolute(position),
        )
    }

    #[must_use]
    pub const fn port_retryable(opcode: DeviceOpcode, occurrences: u32, position: u32) -> Self {
        Self::new(
            ProtocolErrorClass::PortRetryable,
            opcode,
            occurrences,
            TargetPosition::Absolute(position),
        )
    }

    #[must_use]
    pub const fn non_retryable(opcode: DeviceOpcode, occurrences: u32, position: u32) -> Self {
        Self::new(
            ProtocolErrorClass::NonRetryable,
            opcode,
            occurrences,
            TargetPosition::Absolute(position),
        )
    }

    #[must_use]
    pub const fn hard_media(occurrences: u32, position: u32) -> Self {
        Self::new(
            ProtocolErrorClass::HardMedia,
            DeviceOpcode::Read,
            occurrences,
            TargetPosition::Absolute(position),
        )
    }

    #[must_use]
    pub const fn soft_media(occurrences: u32, position: u32) -> Self {
        Self::new(
            ProtocolErrorClass::SoftMedia,
            DeviceOpcode::Read,
            occurrences,
            TargetPosition::Absolute(position),
        )
    }

    /// Retarget at `back` positions before the last one.
    #[must_use]
    pub const fn from_last(mut self, back: u32) -> Self {
        self.position = TargetPosition::FromLast(back);
        self
    }

    #[must_use]
    pub const fn failing_drive(mut self) -> Self {
        self.causes_device_failure = true;
        self
    }

    #[must_use]
    pub const fn in_region(mut self, region: FaultRegion) -> Self {
        self.region = region;
        self
    }

    #[must_use]
    pub const fn tagged(mut self, tag: u32) -> Self {
        self.group_tag = Some(tag);
        self
    }
}

impl fmt::Display for FaultDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x{} {} pos={} region={}",
            self.error_class, self.occurrences, self.opcode, self.position, self.region
        )?;
        if self.causes_device_failure {
            f.write_str(" fails-drive")?;
        }
        if let Some(tag) = self.group_tag {
            write!(f, " tag={tag}")?;
        }
        Ok(())
    }
}
