// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;
use uuid::Uuid;

use crate::hypervisor::HypervisorError;
use crate::tunnel::TunnelError;

/// Errors returned from the migration entry points.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The workload has no migration state to act on yet
    #[error("cannot migrate workload {0} until its migration state is ready")]
    NotReady(String),

    /// The workload's domain does not exist on this host
    #[error("domain {0} not found")]
    DomainNotFound(String),

    /// Migration attempts are one-shot; this one already ran to completion
    #[error("migration job {0} already executed")]
    DuplicateMigration(Uuid),

    /// Somebody else already asked for this migration to be aborted
    #[error("migration abort is already in progress")]
    AbortAlreadyInProgress,

    #[error("failed to cancel migration - workload {0} is not migrating")]
    NotMigrating(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("failed to set up migration tunnels: {0}")]
    TunnelSetup(#[from] TunnelError),

    #[error("failed to update the hosts file: {0}")]
    HostsFile(#[source] std::io::Error),
}

impl MigrationError {
    /// Whether a metadata operation that failed this way may succeed if it
    /// is simply tried again.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, MigrationError::Hypervisor(e) if !e.is_not_found())
    }
}
