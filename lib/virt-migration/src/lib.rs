// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration of live migrations for a workload whose hypervisor is only
//! reachable through host-local sockets.
//!
//! A migration attempt proceeds through [`MigrationManager::start_migration`]:
//! the attempt is registered in the domain's metadata (which makes repeated
//! start requests idempotent), tunnels are opened so the hypervisor's local
//! sockets become reachable over TCP, and a background task starts the
//! hypervisor's migration job and monitors it until it reaches a terminal
//! state. The outcome is persisted back into the domain's metadata, where
//! callers observe it through [`MigrationManager::migration_status`].

mod abort;
mod coordinator;
pub mod disks;
mod error;
pub mod hosts;
pub mod hypervisor;
pub mod monitor;
pub mod store;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use abort::{AbortTask, CancelOutcome};
pub use coordinator::{
    ManagerConfig, MigrationManager, MigrationTask, StartOutcome,
};
pub use error::MigrationError;
pub use hypervisor::{
    Domain, DomainDisk, Hypervisor, HypervisorError, JobInfo, JobState,
    MigrateFlags, MigrationJobParameters,
};
pub use monitor::MigrationOutcome;
pub use store::{MetadataStore, ResultUpdate, RetryPolicy};
pub use tunnel::{Tunnel, TunnelConfig, TunnelError, TunnelRole, TunnelSet};

pub use migration_api_types as api;
