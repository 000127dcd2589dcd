//! Acquisition priority window.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Inclusive `[min, max]` window of job priorities an executor acquires.
///
/// Constructed only through [`PriorityRange::new`], so `min <= max` always holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PriorityRange {
    min: i64,
    max: i64,
}

impl PriorityRange {
    pub fn new(min: i64, max: i64) -> ConfigResult<Self> {
        if min > max {
            return Err(ConfigError::InvalidPriorityRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// The window accepting every priority.
    pub const fn all() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn contains(&self, priority: i64) -> bool {
        self.min <= priority && priority <= self.max
    }

    /// `true` when filtering by this window cannot exclude any job.
    pub fn is_unbounded(&self) -> bool {
        self.min == i64::MIN && self.max == i64::MAX
    }
}

impl Default for PriorityRange {
    fn default() -> Self {
        Self::all()
    }
}

impl<'de> Deserialize<'de> for PriorityRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            min: i64,
            max: i64,
        }

        let raw = Raw::deserialize(deserializer)?;
        PriorityRange::new(raw.min, raw.max).map_err(serde::de::Error::custom)
    }
}
