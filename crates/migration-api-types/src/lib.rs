// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for the types exchanged between the migration orchestrator,
//! its callers, and the hypervisor's persistent domain metadata.

pub mod migration;
pub mod workload;

pub use migration::{
    AbortStatus, Bandwidth, BandwidthParseError, MigrationOptions,
    MigrationRecord,
};
pub use workload::{
    MemorySpec, MigrationMethod, MigrationState, Volume, VolumeSource,
    Workload, WorkloadSpec, WorkloadStatus,
};
