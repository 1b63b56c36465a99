// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-modify-write access to the migration record kept in a domain's
//! metadata.
//!
//! Every update re-reads the record under a single lock held by the
//! [`MetadataStore`], so concurrent tasks working on the same hypervisor
//! connection never overwrite each other's changes. The lock is only held
//! for one read-modify-write and never while polling a job.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::Utc;
use migration_api_types::{AbortStatus, MigrationRecord, Workload};
use slog::{debug, info, o, warn, Logger};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MigrationError;
use crate::hypervisor::{Domain, Hypervisor, HypervisorError};

/// How long to keep retrying a metadata update that failed transiently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub interval: Duration,

    /// Overall time after which the last error is surfaced.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            budget: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.interval,
            initial_interval: self.interval,
            max_interval: self.interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_elapsed_time: Some(self.budget),
            ..Default::default()
        }
    }
}

/// A set of changes to apply to the stored migration record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultUpdate {
    pub failed: bool,

    /// Marks the attempt as finished and stamps its end time.
    pub completed: bool,

    /// Recorded as the failure reason when `failed` is set.
    pub reason: String,

    pub abort_status: Option<AbortStatus>,
}

impl ResultUpdate {
    pub fn completed() -> Self {
        Self { completed: true, ..Default::default() }
    }

    /// A terminal failure. Failed attempts are finished attempts too.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            completed: true,
            reason: reason.into(),
            ..Default::default()
        }
    }

    /// Only moves the abort status; the attempt's outcome is left alone.
    pub fn abort_status(status: AbortStatus) -> Self {
        Self { abort_status: Some(status), ..Default::default() }
    }

    pub fn with_abort_status(self, status: AbortStatus) -> Self {
        Self { abort_status: Some(status), ..self }
    }
}

pub struct MetadataStore {
    hypervisor: Arc<dyn Hypervisor>,
    domain_modify_lock: Mutex<()>,
    retry: RetryPolicy,
    log: Logger,
}

impl MetadataStore {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        retry: RetryPolicy,
        log: &Logger,
    ) -> Self {
        Self {
            hypervisor,
            domain_modify_lock: Mutex::new(()),
            retry,
            log: log.new(o!("component" => "migration-metadata")),
        }
    }

    /// Registers migration attempt `migration_id` for `workload`.
    ///
    /// Returns `true` if the same attempt is already registered and still
    /// running, in which case nothing is written and the caller should leave
    /// the attempt to whichever task owns it. Fails with
    /// [`MigrationError::DuplicateMigration`] if the attempt already ran.
    ///
    /// A retry that finds the exact record this call wrote treats the
    /// earlier write as its own, even if the hypervisor reported it failed.
    pub async fn begin_migration(
        &self,
        workload: &Workload,
        migration_id: Uuid,
    ) -> Result<bool, MigrationError> {
        let record = MigrationRecord::new(migration_id, Utc::now());
        self.with_retry("begin migration", || self.try_begin(workload, &record))
            .await
    }

    /// Applies `update` to the stored record. Does nothing if the domain or
    /// the record no longer exists.
    ///
    /// Requesting [`AbortStatus::InProgress`] while an abort is already in
    /// progress fails with [`MigrationError::AbortAlreadyInProgress`].
    pub async fn record_result(
        &self,
        workload: &Workload,
        update: ResultUpdate,
    ) -> Result<(), MigrationError> {
        // The record last handed to the hypervisor by this call.
        let written = Mutex::new(None);
        self.with_retry("record migration result", || {
            self.try_record(workload, &update, &written)
        })
        .await
    }

    pub async fn record_abort_status(
        &self,
        workload: &Workload,
        status: AbortStatus,
    ) -> Result<(), MigrationError> {
        self.record_result(workload, ResultUpdate::abort_status(status)).await
    }

    /// Reads the stored record, if the domain and a record both exist.
    pub async fn read(
        &self,
        workload: &Workload,
    ) -> Result<Option<MigrationRecord>, MigrationError> {
        let _guard = self.domain_modify_lock.lock().await;

        let domain = match self.lookup(workload).await? {
            Some(domain) => domain,
            None => return Ok(None),
        };
        match domain.migration_metadata().await {
            Ok(record) => Ok(record),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        mut f: F,
    ) -> Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, MigrationError>>,
    {
        backoff::future::retry_notify(
            self.retry.backoff(),
            || {
                let attempt = f();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: MigrationError, wait: Duration| {
                warn!(self.log, "{} failed, will retry", op;
                    "error" => %e, "retry_in" => ?wait);
            },
        )
        .await
    }

    async fn lookup(
        &self,
        workload: &Workload,
    ) -> Result<Option<Arc<dyn Domain>>, MigrationError> {
        match self.hypervisor.lookup_domain(&workload.domain_name()).await {
            Ok(domain) => Ok(Some(domain)),
            Err(HypervisorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_begin(
        &self,
        workload: &Workload,
        record: &MigrationRecord,
    ) -> Result<bool, MigrationError> {
        let migration_id = record.migration_id;
        let _guard = self.domain_modify_lock.lock().await;

        let domain = self.lookup(workload).await?.ok_or_else(|| {
            MigrationError::DomainNotFound(workload.domain_name())
        })?;

        if let Some(stored) = domain.migration_metadata().await? {
            if stored == *record {
                debug!(self.log, "migration attempt registered by a write \
                    reported as failed"; "migration_id" => %migration_id);
                return Ok(false);
            }
            if stored.migration_id == migration_id {
                if stored.is_finished() {
                    let err = MigrationError::DuplicateMigration(migration_id);
                    return Err(err);
                }
                debug!(self.log, "migration attempt already registered";
                    "migration_id" => %migration_id);
                return Ok(true);
            }
        }

        domain.set_migration_metadata(record).await?;
        info!(self.log, "registered migration attempt";
            "workload" => workload.domain_name(),
            "migration_id" => %migration_id);
        Ok(false)
    }

    async fn try_record(
        &self,
        workload: &Workload,
        update: &ResultUpdate,
        written: &Mutex<Option<MigrationRecord>>,
    ) -> Result<(), MigrationError> {
        let _guard = self.domain_modify_lock.lock().await;
        let mut written = written.lock().await;

        let domain = match self.lookup(workload).await? {
            Some(domain) => domain,
            None => return Ok(()),
        };
        let mut record = match domain.migration_metadata().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if written.as_ref() == Some(&record) {
            return Ok(());
        }

        if let Some(status) = update.abort_status {
            if status == AbortStatus::InProgress
                && record.abort_status == AbortStatus::InProgress
            {
                return Err(MigrationError::AbortAlreadyInProgress);
            }
            record.abort_status = status;
        }
        if update.failed {
            record.failed = true;
            record.failure_reason = update.reason.clone();
        }
        if update.completed {
            record.completed = true;
            record.end_timestamp = Some(Utc::now());
        }

        let res = domain.set_migration_metadata(&record).await;
        *written = Some(record);
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
