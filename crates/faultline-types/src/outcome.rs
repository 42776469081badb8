//! Expected and observed error-accounting counters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scenario::{IoQualifier, IoStatus};

/// Expected value of one counter: a literal or a symbolic wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedCount {
    Exact(u32),
    /// Anything, including zero.
    Any,
    /// Equal to the target's element size.
    MatchesElementSize,
    NonZero,
    /// Within one of the retry count that fails a single device.
    RangeAroundSingleFail,
    /// Within two of the retry count that fails two devices.
    RangeAroundDoubleFail,
}

impl Default for ExpectedCount {
    fn default() -> Self {
        Self::Exact(0)
    }
}

impl From<u32> for ExpectedCount {
    fn from(value: u32) -> Self {
        Self::Exact(value)
    }
}

impl fmt::Display for ExpectedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(value) => write!(f, "{value}"),
            Self::Any => f.write_str("ANY"),
            Self::MatchesElementSize => f.write_str("ELEM"),
            Self::NonZero => f.write_str("NZ"),
            Self::RangeAroundSingleFail => f.write_str("~K"),
            Self::RangeAroundDoubleFail => f.write_str("~2K"),
        }
    }
}

/// The counters every hypothesis constrains, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterFamily {
    Retryable,
    NonRetryable,
    Shutdown,
    CorrectableMedia,
    UncorrectableMedia,
    CorrectableTimeStamp,
    UncorrectableTimeStamp,
    CorrectableWriteStamp,
    UncorrectableWriteStamp,
    Coherency,
    CorrectableCrc,
    UncorrectableCrc,
}

impl CounterFamily {
    pub const ALL: [Self; 12] = [
        Self::Retryable,
        Self::NonRetryable,
        Self::Shutdown,
        Self::CorrectableMedia,
        Self::UncorrectableMedia,
        Self::CorrectableTimeStamp,
        Self::UncorrectableTimeStamp,
        Self::CorrectableWriteStamp,
        Self::UncorrectableWriteStamp,
        Self::Coherency,
        Self::CorrectableCrc,
        Self::UncorrectableCrc,
    ];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::Shutdown => "shutdown",
            Self::CorrectableMedia => "c_media",
            Self::UncorrectableMedia => "u_media",
            Self::CorrectableTimeStamp => "c_ts",
            Self::UncorrectableTimeStamp => "u_ts",
            Self::CorrectableWriteStamp => "c_ws",
            Self::UncorrectableWriteStamp => "u_ws",
            Self::Coherency => "coherency",
            Self::CorrectableCrc => "c_crc",
            Self::UncorrectableCrc => "u_crc",
        }
    }
}

impl fmt::Display for CounterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

macro_rules! counter_struct {
    ($(#[$meta:meta])* $name:ident, $ty:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub retryable: $ty,
            pub non_retryable: $ty,
            pub shutdown: $ty,
            pub correctable_media: $ty,
            pub uncorrectable_media: $ty,
            pub correctable_time_stamp: $ty,
            pub uncorrectable_time_stamp: $ty,
            pub correctable_write_stamp: $ty,
            pub uncorrectable_write_stamp: $ty,
            pub coherency: $ty,
            pub correctable_crc: $ty,
            pub uncorrectable_crc: $ty,
        }

        impl $name {
            #[must_use]
            pub const fn get(&self, family: CounterFamily) -> $ty {
                match family {
                    CounterFamily::Retryable => self.retryable,
                    CounterFamily::NonRetryable => self.non_retryable,
                    CounterFamily::Shutdown => self.shutdown,
                    CounterFamily::CorrectableMedia => self.correctable_media,
                    CounterFamily::UncorrectableMedia => self.uncorrectable_media,
                    CounterFamily::CorrectableTimeStamp => self.correctable_time_stamp,
                    CounterFamily::UncorrectableTimeStamp => self.uncorrectable_time_stamp,
                    CounterFamily::CorrectableWriteStamp => self.correctable_write_stamp,
                    CounterFamily::UncorrectableWriteStamp => self.uncorrectable_write_stamp,
                    CounterFamily::Coherency => self.coherency,
                    CounterFamily::CorrectableCrc => self.correctable_crc,
                    CounterFamily::UncorrectableCrc => self.uncorrectable_crc,
                }
            }

            pub fn set(&mut self, family: CounterFamily, value: $ty) {
                let slot = match family {
                    CounterFamily::Retryable => &mut self.retryable,
                    CounterFamily::NonRetryable => &mut self.non_retryable,
                    CounterFamily::Shutdown => &mut self.shutdown,
                    CounterFamily::CorrectableMedia => &mut self.correctable_media,
                    CounterFamily::UncorrectableMedia => &mut self.uncorrectable_media,
                    CounterFamily::CorrectableTimeStamp => &mut self.correctable_time_stamp,
                    CounterFamily::UncorrectableTimeStamp => &mut self.uncorrectable_time_stamp,
                    CounterFamily::CorrectableWriteStamp => &mut self.correctable_write_stamp,
                    CounterFamily::UncorrectableWriteStamp => &mut self.uncorrectable_write_stamp,
                    CounterFamily::Coherency => &mut self.coherency,
                    CounterFamily::CorrectableCrc => &mut self.correctable_crc,
                    CounterFamily::UncorrectableCrc => &mut self.uncorrectable_crc,
                };
                *slot = value;
            }
        }
    };
}

counter_struct!(
    /// Error-accounting counters read back after an I/O.
    ErrorCounters,
    u32
);

counter_struct!(
    /// One complete, indexed guess at what the counters legitimately read
    /// after a case. Unset counters expect zero.
    OutcomeHypothesis,
    ExpectedCount
);

impl OutcomeHypothesis {
    /// Every counter expected to be zero.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Set one counter's expectation.
    #[must_use]
    pub fn with(mut self, family: CounterFamily, expected: impl Into<ExpectedCount>) -> Self {
        self.set(family, expected.into());
        self
    }

    #[must_use]
    pub fn retryable(self, expected: impl Into<ExpectedCount>) -> Self {
        self.with(CounterFamily::Retryable, expected)
    }

    #[must_use]
    pub fn non_retryable(self, expected: impl Into<ExpectedCount>) -> Self {
        self.with(CounterFamily::NonRetryable, expected)
    }

    #[must_use]
    pub fn shutdown(self, expected: impl Into<ExpectedCount>) -> Self {
        self.with(CounterFamily::Shutdown, expected)
    }

    #[must_use]
    pub fn correctable_media(self, expected: impl Into<ExpectedCount>) -> Self {
        self.with(CounterFamily::CorrectableMedia, expected)
    }

    #[must_use]
    pub fn uncorrectable_media(self, expected: impl Into<ExpectedCount>) -> Self {
        self.with(CounterFamily::UncorrectableMedia, expected)
    }
}

/// What the I/O generation service reports once a request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub qualifier: IoQualifier,
    pub error_count: u32,
    pub counters: ErrorCounters,
}

impl IoCompletion {
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: IoStatus::Success,
            qualifier: IoQualifier::None,
            error_count: 0,
            counters: ErrorCounters::default(),
        }
    }
}

impl fmt::Display for IoCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={}/{} errors={}",
            self.status, self.qualifier, self.error_count
        )
    }
}
