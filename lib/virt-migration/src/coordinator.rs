// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a migration attempt from registration to its persisted outcome.
//!
//! An attempt moves through these phases:
//!
//! - Initializing: the attempt is registered in the domain's metadata. A
//!   repeated start request for an attempt that is still running ends here.
//! - TunnelsUp: the hosts entry for the target pod is written and the source
//!   tunnels are opened.
//! - JobRunning: the hypervisor's migration job is started in the background
//!   while a [`ProgressMonitor`] polls it.
//! - Completed, Failed or Aborted: the outcome is recorded exactly once and
//!   the attempt's tunnels are closed.
//!
//! [`MigrationManager::start_migration`] returns once the job is scheduled.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use migration_api_types::{
    MigrationOptions, MigrationRecord, MigrationState, Workload,
};
use slog::{error, info, o, warn, Logger};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::disks::disk_targets_for_migration;
use crate::error::MigrationError;
use crate::hosts::append_host_entry;
use crate::hypervisor::{Domain, Hypervisor, MigrationJobParameters};
use crate::monitor::{
    migration_data_size_gib, MigrationOutcome, ProgressMonitor,
    DEFAULT_POLL_INTERVAL,
};
use crate::store::{MetadataStore, ResultUpdate, RetryPolicy};
use crate::tunnel::{TunnelConfig, TunnelSet};

/// Where the hypervisor sends migration data. The tunnels make the
/// destination reachable on loopback.
const MIGRATION_URI: &str = "tcp://127.0.0.1";

fn control_uri(port: u16) -> String {
    format!("qemu+tcp://127.0.0.1:{port}/system")
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub tunnel: TunnelConfig,
    pub store_retry: RetryPolicy,
    pub poll_interval: Duration,
    pub hosts_file: PathBuf,
    pub ephemeral_disk_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            store_retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            hosts_file: PathBuf::from("/etc/hosts"),
            ephemeral_disk_dir: PathBuf::from(
                "/var/run/kubevirt-ephemeral-disks",
            ),
        }
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    /// A new attempt was started and runs in the background.
    Started(MigrationTask),
    /// The attempt is already running; nothing was started.
    AlreadyInProgress,
}

/// Handle to the background task of a migration attempt. Dropping it leaves
/// the attempt running.
#[derive(Debug)]
pub struct MigrationTask(JoinHandle<MigrationOutcome>);

impl MigrationTask {
    /// Waits for the attempt to finish. Its outcome has been recorded by the
    /// time this returns.
    pub async fn wait(self) -> MigrationOutcome {
        match self.0.await {
            Ok(outcome) => outcome,
            Err(e) => {
                MigrationOutcome::Failed(format!("migration task failed: {e}"))
            }
        }
    }
}

/// Everything fixed at launch that the background task needs.
struct Attempt {
    domain: Arc<dyn Domain>,
    workload: Workload,
    options: MigrationOptions,
    params: MigrationJobParameters,
    tunnels: TunnelSet,
}

/// Orchestrates migrations of the workloads running on one hypervisor
/// connection.
pub struct MigrationManager {
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) config: Arc<ManagerConfig>,
    pub(crate) log: Logger,
}

impl MigrationManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        config: ManagerConfig,
        log: &Logger,
    ) -> Self {
        let store = MetadataStore::new(
            hypervisor.clone(),
            config.store_retry,
            log,
        );
        Self {
            hypervisor,
            store: Arc::new(store),
            config: Arc::new(config),
            log: log.new(o!("component" => "migration")),
        }
    }

    pub(crate) fn workload_logger(
        &self,
        workload: &Workload,
        state: &MigrationState,
    ) -> Logger {
        self.log.new(o!(
            "workload" => workload.domain_name(),
            "migration_id" => state.migration_id.to_string(),
        ))
    }

    /// Starts migrating `workload` to the target named in its migration
    /// state.
    ///
    /// Returns once the migration job has been scheduled; the outcome is
    /// recorded in the domain's metadata when the attempt finishes. Calling
    /// this again for an attempt that is still running is a no-op.
    pub async fn start_migration(
        &self,
        workload: &Workload,
        options: &MigrationOptions,
    ) -> Result<StartOutcome, MigrationError> {
        let state = workload
            .status
            .migration_state
            .as_ref()
            .ok_or_else(|| MigrationError::NotReady(workload.domain_name()))?;
        let log = self.workload_logger(workload, state);

        if self.store.begin_migration(workload, state.migration_id).await? {
            info!(log, "migration attempt already in progress");
            return Ok(StartOutcome::AlreadyInProgress);
        }

        let attempt = match self.launch(workload, state, options, &log).await {
            Ok(attempt) => attempt,
            Err(e) => {
                error!(log, "live migration failed to start"; "error" => %e);
                let update = ResultUpdate::failed(e.to_string());
                let recorded = self.store.record_result(workload, update).await;
                if let Err(re) = recorded {
                    error!(log, "failed to record migration failure";
                        "error" => %re);
                }
                return Err(e);
            }
        };

        let task = tokio::spawn(run_attempt(
            attempt,
            self.store.clone(),
            self.config.clone(),
            log,
        ));
        Ok(StartOutcome::Started(MigrationTask(task)))
    }

    async fn launch(
        &self,
        workload: &Workload,
        state: &MigrationState,
        options: &MigrationOptions,
        log: &Logger,
    ) -> Result<Attempt, MigrationError> {
        append_host_entry(
            &self.config.hosts_file,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &state.target_pod,
        )
        .await
        .map_err(MigrationError::HostsFile)?;

        let block_migration = workload.is_block_migration();
        let specs =
            self.config.tunnel.source_specs(&workload.uid, block_migration);
        let mut tunnels = TunnelSet::open_all(specs, log).await?;

        let domain_name = workload.domain_name();
        let domain = match self.hypervisor.lookup_domain(&domain_name).await {
            Ok(domain) => domain,
            Err(e) => {
                tunnels.close().await;
                return Err(if e.is_not_found() {
                    MigrationError::DomainNotFound(domain_name)
                } else {
                    e.into()
                });
            }
        };

        let disk_targets = match domain.disks().await {
            Ok(disks) => {
                disk_targets_for_migration(&workload.spec.volumes, &disks)
            }
            Err(e) => {
                warn!(log, "failed to read domain disks"; "error" => %e);
                Vec::new()
            }
        };

        if options.unsafe_migration {
            warn!(log, "unsafe migration requested, hypervisor migration \
                checks will be disabled");
        }

        let params = MigrationJobParameters {
            bandwidth_limit_mib: options.bandwidth.as_mebibytes(),
            migration_uri: MIGRATION_URI.to_string(),
            control_uri: control_uri(self.config.tunnel.control_port),
            disk_targets,
            block_migration,
            unsafe_mode: options.unsafe_migration,
            auto_converge: options.allow_auto_converge,
        };
        info!(log, "starting live migration";
            "flags" => ?params.flags(),
            "bandwidth_mib" => params.bandwidth_limit_mib,
            "disks" => ?params.disk_targets);

        Ok(Attempt {
            domain,
            workload: workload.clone(),
            options: options.clone(),
            params,
            tunnels,
        })
    }

    /// Prepares this host to receive `workload`: the target pod's name is
    /// pointed at loopback and a tunnel is opened from the local socket of
    /// every migration port to the hypervisor's TCP endpoint.
    ///
    /// The tunnels stay open until the returned set is closed or dropped.
    pub async fn prepare_migration_target(
        &self,
        workload: &Workload,
    ) -> Result<TunnelSet, MigrationError> {
        let state = workload
            .status
            .migration_state
            .as_ref()
            .ok_or_else(|| MigrationError::NotReady(workload.domain_name()))?;
        let log = self.workload_logger(workload, state);

        append_host_entry(
            &self.config.hosts_file,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &state.target_pod,
        )
        .await
        .map_err(MigrationError::HostsFile)?;

        let specs = self
            .config
            .tunnel
            .target_specs(&workload.uid, workload.is_block_migration());
        let tunnels = TunnelSet::open_all(specs, &log).await?;
        info!(log, "migration target prepared"; "tunnels" => tunnels.len());
        Ok(tunnels)
    }

    /// The persisted record of the workload's latest migration attempt.
    pub async fn migration_status(
        &self,
        workload: &Workload,
    ) -> Result<Option<MigrationRecord>, MigrationError> {
        self.store.read(workload).await
    }
}

async fn run_attempt(
    attempt: Attempt,
    store: Arc<MetadataStore>,
    config: Arc<ManagerConfig>,
    log: Logger,
) -> MigrationOutcome {
    let Attempt { domain, workload, options, params, mut tunnels } = attempt;

    let data_size_gib =
        migration_data_size_gib(&workload, &config.ephemeral_disk_dir, &log)
            .await;

    let (job_tx, job_rx) = oneshot::channel();
    let job = {
        let domain = domain.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let flags = params.flags();
            let res = domain.migrate(&params.control_uri, &params, flags).await;
            match &res {
                Ok(()) => info!(log, "live migration job returned"),
                Err(e) => error!(log, "live migration failed"; "error" => %e),
            }
            // The monitor may already have finished.
            let _ = job_tx.send(res);
        })
    };

    let monitor = ProgressMonitor::new(
        domain,
        &options,
        data_size_gib,
        config.poll_interval,
        job_rx,
        log.clone(),
    );
    let outcome = monitor.run().await;
    info!(log, "migration attempt finished"; "outcome" => ?outcome);

    if let Err(e) = store.record_result(&workload, outcome.to_update()).await {
        error!(log, "failed to record migration result"; "error" => %e);
    }
    tunnels.close().await;

    if let Err(e) = job.await {
        warn!(log, "migration job task did not finish cleanly"; "error" => %e);
    }
    outcome
}
