// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The managed virtual machine as seen by the migration orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::AbortStatus;

/// A virtual machine instance managed by the control plane.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,

    /// Cluster-unique identifier. Tunnel keys and the control socket name
    /// are derived from it.
    pub uid: Uuid,

    #[serde(default)]
    pub spec: WorkloadSpec,

    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    /// The name under which the hypervisor knows this workload's domain.
    pub fn domain_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }

    pub fn is_block_migration(&self) -> bool {
        self.status.migration_method == MigrationMethod::BlockMigration
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(default)]
    pub memory: MemorySpec,
}

/// Memory sizing, in bytes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MemorySpec {
    /// Memory requested from the scheduler.
    pub requested: Option<u64>,

    /// Memory explicitly presented to the guest. Takes precedence over
    /// `requested` when set.
    pub guest: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

/// Where a volume's contents come from.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    PersistentVolumeClaim { claim_name: String },
    DataVolume { name: String },
    HostDisk {
        path: String,
        #[serde(default)]
        shared: bool,
    },
    ConfigMap { name: String },
    Secret { secret_name: String },
    ServiceAccount { service_account_name: String },
    CloudInitNoCloud,
    CloudInitConfigDrive,
    ContainerDisk { image: String },
    EmptyDisk { capacity: u64 },
    Ephemeral { claim_name: String },
}

impl VolumeSource {
    /// Backed by storage that both hosts already see consistently, so the
    /// contents never need to be copied.
    pub fn is_shared(&self) -> bool {
        match self {
            VolumeSource::PersistentVolumeClaim { .. }
            | VolumeSource::DataVolume { .. } => true,
            VolumeSource::HostDisk { shared, .. } => *shared,
            _ => false,
        }
    }

    /// Generated locally from cluster objects (or a container image) when
    /// the workload starts.
    pub fn is_generated(&self) -> bool {
        matches!(
            self,
            VolumeSource::ConfigMap { .. }
                | VolumeSource::Secret { .. }
                | VolumeSource::ServiceAccount { .. }
                | VolumeSource::CloudInitNoCloud
                | VolumeSource::CloudInitConfigDrive
                | VolumeSource::ContainerDisk { .. }
        )
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
pub enum MigrationMethod {
    /// Only guest memory and device state move between hosts.
    #[default]
    LiveMigration,

    /// Non-shared disk contents are copied alongside guest memory.
    BlockMigration,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub migration_method: MigrationMethod,

    /// Mirrors the persisted migration record for the current attempt.
    /// `None` until the control plane has scheduled a migration.
    pub migration_state: Option<MigrationState>,
}

/// The caller-visible view of the current migration attempt.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigrationState {
    pub migration_id: Uuid,

    /// Hostname of the pod that will receive the workload.
    pub target_pod: String,

    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub abort_status: AbortStatus,
}

impl MigrationState {
    pub fn new(migration_id: Uuid, target_pod: impl Into<String>) -> Self {
        Self {
            migration_id,
            target_pod: target_pod.into(),
            start_timestamp: None,
            end_timestamp: None,
            completed: false,
            failed: false,
            abort_status: AbortStatus::None,
        }
    }

    /// Whether an abort request makes sense for this attempt.
    pub fn is_migrating(&self) -> bool {
        !self.completed && !self.failed && self.start_timestamp.is_some()
    }
}
