// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capabilities the orchestrator needs from the hypervisor connection.
//!
//! The connection itself (and the rendering of domain descriptions) lives
//! outside this crate. The orchestrator only depends on these traits, which
//! keeps the migration logic testable against in-memory doubles.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use migration_api_types::MigrationRecord;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("domain {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Operation(String),
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound(_))
    }
}

/// The hypervisor's view of a domain's background job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// No job has started on the domain yet.
    None,
    /// A job with a known completion point is running.
    Bounded,
    /// A job without a known completion point (such as a live migration) is
    /// running.
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobInfo {
    pub state: JobState,

    /// Bytes the job still has to transfer.
    pub data_remaining: u64,
}

impl JobInfo {
    pub fn new(state: JobState, data_remaining: u64) -> Self {
        Self { state, data_remaining }
    }
}

/// A disk as it appears in the domain description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainDisk {
    /// Backing type, e.g. `file`, `block` or `network`.
    pub disk_type: String,

    /// Device alias; matches the name of the workload volume backing it.
    pub alias: Option<String>,

    pub read_only: bool,

    /// Guest-visible target device name, e.g. `vda`.
    pub target_device: String,
}

bitflags! {
    /// Flags controlling how the hypervisor performs a migration job.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        const LIVE = 1 << 0;
        const PEER2PEER = 1 << 1;
        const NON_SHARED_INC = 1 << 7;
        const UNSAFE = 1 << 9;
        const AUTO_CONVERGE = 1 << 13;
    }
}

/// Parameters for one migration job, fixed for the lifetime of the attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationJobParameters {
    /// Transfer rate limit in MiB/s; zero leaves it unlimited.
    pub bandwidth_limit_mib: u64,

    /// Where the hypervisor sends migration data.
    pub migration_uri: String,

    /// The destination hypervisor's control connection.
    pub control_uri: String,

    /// Target devices of disks whose contents must be copied.
    pub disk_targets: Vec<String>,

    pub block_migration: bool,
    pub unsafe_mode: bool,
    pub auto_converge: bool,
}

impl MigrationJobParameters {
    pub fn flags(&self) -> MigrateFlags {
        let mut flags = MigrateFlags::LIVE | MigrateFlags::PEER2PEER;
        if self.block_migration {
            flags |= MigrateFlags::NON_SHARED_INC;
        }
        if self.unsafe_mode {
            flags |= MigrateFlags::UNSAFE;
        }
        if self.auto_converge {
            flags |= MigrateFlags::AUTO_CONVERGE;
        }
        flags
    }
}

/// A connection to the host's hypervisor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Looks up a domain by name. Fails with [`HypervisorError::NotFound`]
    /// if the domain does not exist.
    async fn lookup_domain(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Domain>, HypervisorError>;
}

/// A handle to one of the hypervisor's domains.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Domain: Send + Sync {
    /// Reads the migration record stored in the domain's metadata.
    async fn migration_metadata(
        &self,
    ) -> Result<Option<MigrationRecord>, HypervisorError>;

    /// Replaces the migration record stored in the domain's metadata.
    async fn set_migration_metadata(
        &self,
        record: &MigrationRecord,
    ) -> Result<(), HypervisorError>;

    /// Runs a migration job to completion. This does not return until the
    /// job has finished, failed or been aborted.
    async fn migrate(
        &self,
        control_uri: &str,
        params: &MigrationJobParameters,
        flags: MigrateFlags,
    ) -> Result<(), HypervisorError>;

    async fn job_info(&self) -> Result<JobInfo, HypervisorError>;

    async fn abort_job(&self) -> Result<(), HypervisorError>;

    /// Lists the disks in the domain's live description.
    async fn disks(&self) -> Result<Vec<DomainDisk>, HypervisorError>;
}
