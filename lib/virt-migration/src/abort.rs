// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use migration_api_types::{AbortStatus, Workload};
use slog::{debug, error, info, warn, Logger};
use tokio::task::JoinHandle;

use crate::coordinator::MigrationManager;
use crate::error::MigrationError;
use crate::hypervisor::{Hypervisor, JobState};
use crate::store::MetadataStore;

#[derive(Debug)]
pub enum CancelOutcome {
    /// The abort was recorded and a task is aborting the job.
    AbortRequested(AbortTask),
    /// Another caller already requested an abort.
    AlreadyAborting,
}

/// Handle to the background task aborting a migration job. Dropping it
/// leaves the task running.
#[derive(Debug)]
pub struct AbortTask(JoinHandle<()>);

impl AbortTask {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

impl MigrationManager {
    /// Requests that the workload's running migration be aborted.
    ///
    /// The request is recorded before this returns; the hypervisor job is
    /// aborted in the background. The monitor of the attempt then observes
    /// the cancelled job and records the final outcome.
    pub async fn cancel_migration(
        &self,
        workload: &Workload,
    ) -> Result<CancelOutcome, MigrationError> {
        let state = match &workload.status.migration_state {
            Some(state) if state.is_migrating() => state,
            _ => {
                return Err(MigrationError::NotMigrating(
                    workload.domain_name(),
                ))
            }
        };
        let log = self.workload_logger(workload, state);

        match self
            .store
            .record_abort_status(workload, AbortStatus::InProgress)
            .await
        {
            Ok(()) => {}
            Err(MigrationError::AbortAlreadyInProgress) => {
                info!(log, "migration abort already in progress");
                return Ok(CancelOutcome::AlreadyAborting);
            }
            Err(e) => return Err(e),
        }

        info!(log, "aborting live migration");
        let task = tokio::spawn(abort_running_job(
            self.hypervisor.clone(),
            self.store.clone(),
            workload.clone(),
            log,
        ));
        Ok(CancelOutcome::AbortRequested(AbortTask(task)))
    }
}

async fn abort_running_job(
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<MetadataStore>,
    workload: Workload,
    log: Logger,
) {
    let domain = match hypervisor.lookup_domain(&workload.domain_name()).await
    {
        Ok(domain) => domain,
        Err(e) => {
            warn!(log, "failed to look up domain to abort"; "error" => %e);
            return;
        }
    };
    let info = match domain.job_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(log, "failed to get domain job info"; "error" => %e);
            return;
        }
    };
    if info.state != JobState::Unbounded {
        debug!(log, "no running migration job to abort";
            "job_state" => ?info.state);
        return;
    }

    match domain.abort_job().await {
        Ok(()) => info!(log, "live migration job aborted"),
        Err(e) => {
            error!(log, "failed to abort live migration"; "error" => %e);
            let recorded =
                store.record_abort_status(&workload, AbortStatus::Failed).await;
            if let Err(e) = recorded {
                error!(log, "failed to record abort failure"; "error" => %e);
            }
        }
    }
}
