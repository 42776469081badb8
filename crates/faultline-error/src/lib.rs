use std::time::Duration;

use thiserror::Error;

/// Primary error type for the retry-validation harness.
///
/// Every variant is fatal for the scenario that raised it. The harness exists
/// to detect deviation in the system under test, so nothing here carries a
/// "retry me" semantic; the categories only drive diagnostics and exit codes.
#[derive(Error, Debug)]
pub enum HarnessError {
    // === Setup Errors ===
    /// A fault definition resolved to a position outside the target's width.
    #[error("position {position} is out of range for width {width} (case {source_tag})")]
    InvalidPosition {
        source_tag: String,
        position: String,
        width: u32,
    },

    /// A scenario case is internally inconsistent.
    #[error("invalid scenario {source_tag}: {detail}")]
    InvalidScenario { source_tag: String, detail: String },

    /// Creating or removing a fault-injection record failed.
    #[error("fault record {operation} failed: {detail}")]
    FaultRecord {
        operation: &'static str,
        detail: String,
    },

    /// A geometry query returned nothing usable for the requested region.
    #[error("geometry unavailable for object {object}: {detail}")]
    Geometry { object: u32, detail: String },

    /// A lookup by logical number or location found no object.
    #[error("object not found: {what}")]
    ObjectNotFound { what: String },

    // === Timeout Errors ===
    /// A bounded wait exceeded its ceiling.
    #[error("timed out after {waited:?} waiting for {what} (last observed: {last_observed})")]
    Timeout {
        what: String,
        waited: Duration,
        last_observed: String,
    },

    // === Validation Errors ===
    /// The observed outcome matched none of the declared hypotheses.
    #[error("outcome mismatch for {source_tag}:\n{report}")]
    Validation { source_tag: String, report: String },

    // === Integrity Errors ===
    /// Harness-owned bookkeeping disagrees with the target system.
    #[error("harness integrity fault: {detail}")]
    Integrity { detail: String },

    // === Service Errors ===
    /// One of the external services rejected a request.
    #[error("{service} service error: {detail}")]
    Service {
        service: &'static str,
        detail: String,
    },

    /// A scenario failed; carries the case identity around the root cause.
    #[error("scenario {source_tag} ({description}) on {target} failed: {source}")]
    Scenario {
        source_tag: String,
        description: String,
        target: String,
        #[source]
        source: Box<HarnessError>,
    },

    // === Ambient Errors ===
    /// File I/O error (artifacts, configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (configuration, catalog export, events).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration value could not be parsed.
    #[error("invalid configuration {key}: {detail}")]
    Config { key: String, detail: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classes used for triage and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCategory {
    Setup = 10,
    Timeout = 11,
    Validation = 12,
    Integrity = 13,
    Service = 14,
    Environment = 15,
    Internal = 16,
}

impl HarnessError {
    #[allow(clippy::match_same_arms)]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPosition { .. }
            | Self::InvalidScenario { .. }
            | Self::FaultRecord { .. }
            | Self::Geometry { .. }
            | Self::ObjectNotFound { .. } => ErrorCategory::Setup,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::Service { .. } => ErrorCategory::Service,
            Self::Scenario { source, .. } => source.category(),
            Self::Io(_) | Self::Json(_) | Self::Config { .. } => ErrorCategory::Environment,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Innermost error, skipping scenario wrappers.
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Scenario { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self.root_cause() {
            Self::InvalidPosition { .. } => {
                Some("Restrict the case's widths or use a position counted from the last drive")
            }
            Self::Timeout { .. } => {
                Some("The target looks stuck; inspect the last observed value before re-running")
            }
            Self::Validation { .. } => Some(
                "Compare actual against each hypothesis; re-run with --start-tag to reproduce",
            ),
            Self::Integrity { .. } => {
                Some("Another actor changed drive settings while the harness held them")
            }
            Self::FaultRecord { .. } => Some("Check that the fault-injection service is loaded"),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.category() as i32
    }

    /// Wrap an error with the identity of the scenario that raised it.
    #[must_use]
    pub fn in_scenario(
        self,
        source_tag: impl Into<String>,
        description: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::Scenario {
            source_tag: source_tag.into(),
            description: description.into(),
            target: target.into(),
            source: Box::new(self),
        }
    }

    pub fn invalid_scenario(source_tag: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidScenario {
            source_tag: source_tag.into(),
            detail: detail.into(),
        }
    }

    pub fn fault_record(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::FaultRecord {
            operation,
            detail: detail.into(),
        }
    }

    pub fn timeout(
        what: impl Into<String>,
        waited: Duration,
        last_observed: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
            last_observed: last_observed.into(),
        }
    }

    pub fn service(service: &'static str, detail: impl Into<String>) -> Self {
        Self::Service {
            service,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::ObjectNotFound { what: what.into() }
    }

    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::Integrity {
            detail: detail.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
