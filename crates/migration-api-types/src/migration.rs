// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Progress of a request to abort an in-flight migration.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
pub enum AbortStatus {
    #[default]
    None,
    InProgress,
    Succeeded,
    Failed,
}

/// The record of one migration attempt, persisted in the domain's metadata.
///
/// A record is created when an attempt starts and is only ever updated
/// afterwards; the next attempt's record replaces it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub migration_id: Uuid,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Set once the attempt has reached a final outcome, successful or not.
    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub failure_reason: String,

    #[serde(default)]
    pub abort_status: AbortStatus,
}

impl MigrationRecord {
    pub fn new(migration_id: Uuid, start_timestamp: DateTime<Utc>) -> Self {
        Self {
            migration_id,
            start_timestamp,
            end_timestamp: None,
            completed: false,
            failed: false,
            failure_reason: String::new(),
            abort_status: AbortStatus::None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_timestamp.is_some()
    }
}

/// Caller-supplied knobs for a single migration attempt.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationOptions {
    /// Transfer rate limit. Zero leaves the rate unlimited.
    pub bandwidth: Bandwidth,

    /// Disables the hypervisor's own safety checks on the migration.
    pub unsafe_migration: bool,

    /// Lets the hypervisor throttle the guest's vCPUs until the memory
    /// transfer converges.
    pub allow_auto_converge: bool,

    /// How long the remaining-data watermark may go without improving
    /// before the attempt is considered stuck. Zero disables the check.
    #[serde(with = "duration_secs")]
    pub progress_timeout: Duration,

    /// Time budget per GiB of data to migrate. Zero disables the check.
    #[serde(with = "duration_secs")]
    pub completion_timeout_per_gib: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::from_bytes(64 * MIB),
            unsafe_migration: false,
            allow_auto_converge: false,
            progress_timeout: Duration::from_secs(150),
            completion_timeout_per_gib: Duration::from_secs(800),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BandwidthParseError {
    #[error("empty bandwidth quantity")]
    Empty,

    #[error("invalid bandwidth quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown bandwidth suffix {0:?}")]
    UnknownSuffix(String),

    #[error("bandwidth quantity {0:?} overflows")]
    Overflow(String),
}

/// A data rate in bytes per second, written as a Kubernetes-style quantity
/// (`"64Mi"`, `"1G"`, `"1048576"`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bandwidth(u64);

impl Bandwidth {
    pub const UNLIMITED: Bandwidth = Bandwidth(0);

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    /// The rate in MiB/s as the hypervisor expects it. Partial mebibytes
    /// round up so that a small limit never turns into "unlimited".
    pub fn as_mebibytes(&self) -> u64 {
        self.0.div_ceil(MIB)
    }
}

impl FromStr for Bandwidth {
    type Err = BandwidthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BandwidthParseError::Empty);
        }
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        if digits.is_empty() {
            return Err(BandwidthParseError::InvalidNumber(s.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| BandwidthParseError::Overflow(s.to_string()))?;
        let scale = match suffix {
            "" => 1,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            "Ki" => KIB,
            "Mi" => MIB,
            "Gi" => GIB,
            "Ti" => TIB,
            other => {
                return Err(BandwidthParseError::UnknownSuffix(
                    other.to_string(),
                ))
            }
        };
        value
            .checked_mul(scale)
            .map(Bandwidth)
            .ok_or_else(|| BandwidthParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SUFFIXES: [(u64, &str); 4] =
            [(TIB, "Ti"), (GIB, "Gi"), (MIB, "Mi"), (KIB, "Ki")];
        let (value, suffix) = SUFFIXES
            .into_iter()
            .find(|(scale, _)| self.0 != 0 && self.0 % scale == 0)
            .map(|(scale, suffix)| (self.0 / scale, suffix))
            .unwrap_or((self.0, ""));
        write!(f, "{value}{suffix}")
    }
}

impl Serialize for Bandwidth {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
