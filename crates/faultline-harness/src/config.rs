//! Harness configuration: poll ceilings, service-timeout override, artifacts.
//!
//! Defaults are usable as-is against the simulated array. A JSON file can
//! override any subset of fields, and `FAULTLINE_*` environment variables
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use faultline_error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::poll::PollPolicy;

/// Environment variable that selects the tracing filter in the runner bin.
pub const LOG_FILTER_ENV: &str = "FAULTLINE_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Ceiling for drive/raid-group state transitions and object churn.
    #[serde(with = "millis")]
    pub state_ceiling: Duration,
    #[serde(with = "millis")]
    pub rebuild_ceiling: Duration,
    #[serde(with = "millis")]
    pub verify_ceiling: Duration,
    #[serde(with = "millis")]
    pub notification_ceiling: Duration,
    #[serde(with = "millis")]
    pub io_ceiling: Duration,
    /// Service timeout applied to a drive when a case asks for the short one.
    #[serde(with = "millis")]
    pub short_service_timeout: Duration,
    /// Write the case's range with a known pattern before running it.
    pub seed_pattern: bool,
    /// Where run bundles go; `None` disables them.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            state_ceiling: Duration::from_secs(30),
            rebuild_ceiling: Duration::from_secs(120),
            verify_ceiling: Duration::from_secs(120),
            notification_ceiling: Duration::from_secs(30),
            io_ceiling: Duration::from_secs(60),
            short_service_timeout: Duration::from_millis(500),
            seed_pattern: true,
            artifact_dir: None,
        }
    }
}

impl HarnessConfig {
    /// Load a JSON config file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|err| HarnessError::Config {
            key: path.display().to_string(),
            detail: err.to_string(),
        })?;
        debug!(path = %path.display(), "loaded harness config");
        config.checked()
    }

    /// Apply `FAULTLINE_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis_fields: [(&str, &mut Duration); 7] = [
            ("FAULTLINE_POLL_INTERVAL_MS", &mut self.poll_interval),
            ("FAULTLINE_STATE_CEILING_MS", &mut self.state_ceiling),
            ("FAULTLINE_REBUILD_CEILING_MS", &mut self.rebuild_ceiling),
            ("FAULTLINE_VERIFY_CEILING_MS", &mut self.verify_ceiling),
            ("FAULTLINE_NOTIFICATION_CEILING_MS", &mut self.notification_ceiling),
            ("FAULTLINE_IO_CEILING_MS", &mut self.io_ceiling),
            ("FAULTLINE_SHORT_SERVICE_TIMEOUT_MS", &mut self.short_service_timeout),
        ];
        for (key, slot) in millis_fields {
            if let Some(raw) = lookup(key) {
                *slot = Duration::from_millis(parse_value(key, &raw)?);
            }
        }
        if let Some(raw) = lookup("FAULTLINE_SEED_PATTERN") {
            self.seed_pattern = match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(HarnessError::Config {
                        key: "FAULTLINE_SEED_PATTERN".to_owned(),
                        detail: format!("expected a boolean, got {other:?}"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("FAULTLINE_ARTIFACT_DIR") {
            self.artifact_dir = (!raw.trim().is_empty()).then(|| PathBuf::from(raw));
        }
        self.checked()
    }

    fn checked(self) -> Result<Self> {
        if self.poll_interval.is_zero() {
            return Err(HarnessError::Config {
                key: "poll_interval".to_owned(),
                detail: "must be non-zero".to_owned(),
            });
        }
        Ok(self)
    }

    #[must_use]
    pub const fn state_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.state_ceiling)
    }

    #[must_use]
    pub const fn rebuild_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.rebuild_ceiling)
    }

    #[must_use]
    pub const fn verify_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.verify_ceiling)
    }
}

fn parse_value(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| HarnessError::Config {
        key: key.to_owned(),
        detail: format!("expected milliseconds, got {raw:?}"),
    })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
