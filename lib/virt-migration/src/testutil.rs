// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory hypervisor used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use migration_api_types::{
    MemorySpec, MigrationRecord, MigrationState, Workload, WorkloadSpec,
    WorkloadStatus,
};
use slog::{o, Logger};
use uuid::Uuid;

use crate::hypervisor::{
    Domain, DomainDisk, Hypervisor, HypervisorError, JobInfo, JobState,
    MigrateFlags, MigrationJobParameters,
};

pub(crate) const GIB: u64 = 1 << 30;

pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A 1 GiB workload with a migration scheduled but not yet started.
pub(crate) fn test_workload() -> Workload {
    Workload {
        name: "vm0".to_string(),
        namespace: "default".to_string(),
        uid: Uuid::new_v4(),
        spec: WorkloadSpec {
            volumes: Vec::new(),
            memory: MemorySpec { requested: Some(GIB), guest: None },
        },
        status: WorkloadStatus {
            migration_state: Some(MigrationState::new(
                Uuid::new_v4(),
                "target-pod",
            )),
            ..Default::default()
        },
    }
}

#[derive(Default)]
pub(crate) struct FakeHypervisor {
    domains: Mutex<HashMap<String, Arc<FakeDomain>>>,
}

impl FakeHypervisor {
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_domain(
        workload: &Workload,
        domain: Arc<FakeDomain>,
    ) -> Arc<Self> {
        let hv = Self::empty();
        hv.domains.lock().unwrap().insert(workload.domain_name(), domain);
        hv
    }

    pub(crate) fn remove_domain(&self, workload: &Workload) {
        self.domains.lock().unwrap().remove(&workload.domain_name());
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn lookup_domain(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Domain>, HypervisorError> {
        match self.domains.lock().unwrap().get(name) {
            Some(domain) => Ok(domain.clone()),
            None => Err(HypervisorError::NotFound(name.to_string())),
        }
    }
}

struct DomainState {
    record: Option<MigrationRecord>,
    metadata_writes: usize,
    terminal_writes: usize,
    failing_writes: usize,
    lost_write_acks: usize,
    job: JobInfo,
    job_script: VecDeque<JobInfo>,
    job_info_error: Option<HypervisorError>,
    migrations: Vec<(String, MigrationJobParameters, MigrateFlags)>,
    migrate_error: Option<HypervisorError>,
    abort_calls: usize,
    abort_error: Option<HypervisorError>,
    cancel_on_abort: bool,
    disks: Vec<DomainDisk>,
}

/// A domain whose migration job is driven by the test: the job reports
/// whatever was last scripted, and `migrate` returns immediately.
pub(crate) struct FakeDomain {
    state: Mutex<DomainState>,
}

impl FakeDomain {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DomainState {
                record: None,
                metadata_writes: 0,
                terminal_writes: 0,
                failing_writes: 0,
                lost_write_acks: 0,
                job: JobInfo::new(JobState::None, 0),
                job_script: VecDeque::new(),
                job_info_error: None,
                migrations: Vec::new(),
                migrate_error: None,
                abort_calls: 0,
                abort_error: None,
                cancel_on_abort: false,
                disks: Vec::new(),
            }),
        })
    }

    pub(crate) fn record(&self) -> Option<MigrationRecord> {
        self.state.lock().unwrap().record.clone()
    }

    pub(crate) fn set_record(&self, record: MigrationRecord) {
        self.state.lock().unwrap().record = Some(record);
    }

    /// Metadata writes that persisted so far.
    pub(crate) fn metadata_writes(&self) -> usize {
        self.state.lock().unwrap().metadata_writes
    }

    /// Writes that moved the record from unfinished to finished.
    pub(crate) fn terminal_writes(&self) -> usize {
        self.state.lock().unwrap().terminal_writes
    }

    /// Makes the next `count` metadata writes fail with a transient error.
    pub(crate) fn fail_metadata_writes(&self, count: usize) {
        self.state.lock().unwrap().failing_writes = count;
    }

    /// Makes the next `count` metadata writes persist but report a
    /// transient error, as if the reply was lost.
    pub(crate) fn lose_write_acks(&self, count: usize) {
        self.state.lock().unwrap().lost_write_acks = count;
    }

    pub(crate) fn set_job(&self, job: JobInfo) {
        let mut state = self.state.lock().unwrap();
        state.job_script.clear();
        state.job = job;
    }

    /// Queues job states to be reported by successive polls. Once the
    /// script runs out, the last state keeps being reported.
    pub(crate) fn script_jobs(&self, jobs: impl IntoIterator<Item = JobInfo>) {
        self.state.lock().unwrap().job_script.extend(jobs);
    }

    pub(crate) fn fail_job_info(&self, err: HypervisorError) {
        self.state.lock().unwrap().job_info_error = Some(err);
    }

    pub(crate) fn migrations(
        &self,
    ) -> Vec<(String, MigrationJobParameters, MigrateFlags)> {
        self.state.lock().unwrap().migrations.clone()
    }

    pub(crate) fn fail_migrate(&self, err: HypervisorError) {
        self.state.lock().unwrap().migrate_error = Some(err);
    }

    pub(crate) fn abort_calls(&self) -> usize {
        self.state.lock().unwrap().abort_calls
    }

    pub(crate) fn fail_abort(&self, err: HypervisorError) {
        self.state.lock().unwrap().abort_error = Some(err);
    }

    /// Makes a successful abort move the job to `Cancelled`.
    pub(crate) fn cancel_on_abort(&self) {
        self.state.lock().unwrap().cancel_on_abort = true;
    }

    pub(crate) fn set_disks(&self, disks: Vec<DomainDisk>) {
        self.state.lock().unwrap().disks = disks;
    }
}

#[async_trait]
impl Domain for FakeDomain {
    async fn migration_metadata(
        &self,
    ) -> Result<Option<MigrationRecord>, HypervisorError> {
        Ok(self.state.lock().unwrap().record.clone())
    }

    async fn set_migration_metadata(
        &self,
        record: &MigrationRecord,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(HypervisorError::Operation(
                "metadata update conflict".to_string(),
            ));
        }
        let was_finished =
            state.record.as_ref().map_or(false, MigrationRecord::is_finished);
        if !was_finished && record.is_finished() {
            state.terminal_writes += 1;
        }
        state.metadata_writes += 1;
        state.record = Some(record.clone());
        if state.lost_write_acks > 0 {
            state.lost_write_acks -= 1;
            return Err(HypervisorError::Operation(
                "reply timed out".to_string(),
            ));
        }
        Ok(())
    }

    async fn migrate(
        &self,
        control_uri: &str,
        params: &MigrationJobParameters,
        flags: MigrateFlags,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let call = (control_uri.to_string(), params.clone(), flags);
        state.migrations.push(call);
        match state.migrate_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn job_info(&self) -> Result<JobInfo, HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.job_info_error.clone() {
            return Err(err);
        }
        if let Some(next) = state.job_script.pop_front() {
            state.job = next;
        }
        Ok(state.job)
    }

    async fn abort_job(&self) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.abort_calls += 1;
        if let Some(err) = state.abort_error.clone() {
            return Err(err);
        }
        if state.cancel_on_abort {
            state.job_script.clear();
            let remaining = state.job.data_remaining;
            state.job = JobInfo::new(JobState::Cancelled, remaining);
        }
        Ok(())
    }

    async fn disks(&self) -> Result<Vec<DomainDisk>, HypervisorError> {
        Ok(self.state.lock().unwrap().disks.clone())
    }
}
