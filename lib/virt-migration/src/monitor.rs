// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Watches a running migration job until it reaches a terminal state.
//!
//! The hypervisor offers no completion notification that survives a lost
//! connection, so the job is polled. While it runs, the lowest amount of
//! remaining data seen so far (the watermark) tracks whether the job is
//! still making progress. A job that stops improving for longer than the
//! progress timeout, or that runs past its completion budget, is aborted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use migration_api_types::{AbortStatus, MigrationOptions, Workload};
use slog::{debug, error, info, warn, Logger};
use tokio::sync::oneshot;
use tokio::time::Instant;
use walkdir::WalkDir;

use crate::hypervisor::{Domain, HypervisorError, JobState};
use crate::store::ResultUpdate;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Shorter poll intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

const GIB: u64 = 1 << 30;

/// How a migration attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    Completed,
    Failed(String),
    /// The job was aborted, either by the monitor or at a caller's request.
    Aborted(String),
}

impl MigrationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, MigrationOutcome::Completed)
    }

    /// The record update that persists this outcome.
    pub fn to_update(&self) -> ResultUpdate {
        match self {
            MigrationOutcome::Completed => ResultUpdate::completed(),
            MigrationOutcome::Failed(reason) => ResultUpdate::failed(reason),
            MigrationOutcome::Aborted(reason) => ResultUpdate::failed(reason)
                .with_abort_status(AbortStatus::Succeeded),
        }
    }
}

/// Why a running job is being given up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stall {
    /// The watermark has not improved for this long.
    Stuck(Duration),
    /// The job has not finished within this completion budget.
    OverBudget(Duration),
}

impl Stall {
    pub fn reason(&self) -> String {
        match self {
            Stall::Stuck(delay) => format!(
                "Live migration stuck for {} sec and has been aborted",
                delay.as_secs()
            ),
            Stall::OverBudget(budget) => format!(
                "Live migration is not completed after {} sec and has been \
                aborted",
                budget.as_secs()
            ),
        }
    }
}

/// Tracks the remaining-data watermark of an unbounded job.
#[derive(Debug)]
pub struct ProgressTracker {
    progress_timeout: Duration,
    acceptable_completion_time: Duration,
    started_at: Instant,
    watermark: u64,
    last_progress_at: Instant,
}

impl ProgressTracker {
    /// A zero `progress_timeout` or `acceptable_completion_time` disables
    /// the corresponding check.
    pub fn new(
        progress_timeout: Duration,
        acceptable_completion_time: Duration,
        started_at: Instant,
    ) -> Self {
        Self {
            progress_timeout,
            acceptable_completion_time,
            started_at,
            watermark: 0,
            last_progress_at: started_at,
        }
    }

    /// Records a sample of the job's remaining data. Returns the reason to
    /// abort the job, if any. When the job is both stuck and over budget,
    /// only the stall is reported.
    pub fn observe(&mut self, now: Instant, remaining: u64) -> Option<Stall> {
        if self.watermark == 0 || remaining < self.watermark {
            self.watermark = remaining;
            self.last_progress_at = now;
        }

        let delay = now.saturating_duration_since(self.last_progress_at);
        if !self.progress_timeout.is_zero() && delay > self.progress_timeout {
            return Some(Stall::Stuck(delay));
        }

        let elapsed = now.saturating_duration_since(self.started_at);
        if !self.acceptable_completion_time.is_zero()
            && elapsed > self.acceptable_completion_time
        {
            return Some(Stall::OverBudget(self.acceptable_completion_time));
        }
        None
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }
}

/// Estimates how much data the migration moves, in whole GiB (rounded up).
///
/// Guest memory takes precedence over requested memory. Block migrations
/// also count every file under `ephemeral_disk_dir`.
pub async fn migration_data_size_gib(
    workload: &Workload,
    ephemeral_disk_dir: &Path,
    log: &Logger,
) -> u64 {
    let memory = &workload.spec.memory;
    let mut bytes = memory.guest.or(memory.requested).unwrap_or(0);

    if workload.is_block_migration() {
        let dir = ephemeral_disk_dir.to_path_buf();
        let walked =
            tokio::task::spawn_blocking(move || directory_size(&dir)).await;
        match walked {
            Ok(Ok(size)) => bytes = bytes.saturating_add(size),
            Ok(Err(e)) => warn!(log, "failed to size ephemeral disks";
                "dir" => %ephemeral_disk_dir.display(), "error" => %e),
            Err(e) => warn!(log, "ephemeral disk walk did not finish";
                "error" => %e),
        }
    }
    bytes.div_ceil(GIB)
}

fn directory_size(root: &Path) -> Result<u64, walkdir::Error> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        total = total.saturating_add(entry.metadata()?.len());
    }
    Ok(total)
}

/// Time allowed for a migration of `data_size_gib` to complete.
pub fn acceptable_completion_time(
    options: &MigrationOptions,
    data_size_gib: u64,
) -> Duration {
    let gib = u32::try_from(data_size_gib).unwrap_or(u32::MAX);
    options.completion_timeout_per_gib.saturating_mul(gib)
}

/// Polls one migration job. Consumes the job-start task's result, so that a
/// job that fails to start is reported without waiting for the hypervisor.
pub struct ProgressMonitor {
    domain: Arc<dyn Domain>,
    progress_timeout: Duration,
    acceptable_completion_time: Duration,
    poll_interval: Duration,
    job_rx: oneshot::Receiver<Result<(), HypervisorError>>,
    log: Logger,
}

impl ProgressMonitor {
    pub fn new(
        domain: Arc<dyn Domain>,
        options: &MigrationOptions,
        data_size_gib: u64,
        poll_interval: Duration,
        job_rx: oneshot::Receiver<Result<(), HypervisorError>>,
        log: Logger,
    ) -> Self {
        Self {
            domain,
            progress_timeout: options.progress_timeout,
            acceptable_completion_time: acceptable_completion_time(
                options,
                data_size_gib,
            ),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            job_rx,
            log,
        }
    }

    /// Polls until the job reaches a terminal state and returns it. Aborts
    /// the job at most once.
    pub async fn run(self) -> MigrationOutcome {
        let Self {
            domain,
            progress_timeout,
            acceptable_completion_time,
            poll_interval,
            job_rx,
            log,
        } = self;

        let mut tracker = ProgressTracker::new(
            progress_timeout,
            acceptable_completion_time,
            Instant::now(),
        );
        let mut job_rx = Some(job_rx);
        let mut job_started = false;

        loop {
            let received = job_rx.as_mut().map(|rx| rx.try_recv());
            match received {
                None | Some(Err(oneshot::error::TryRecvError::Empty)) => {}
                Some(Ok(Ok(()))) => {
                    job_started = true;
                    job_rx = None;
                }
                Some(Ok(Err(e))) => {
                    error!(log, "live migration failed"; "error" => %e);
                    return MigrationOutcome::Failed(format!(
                        "Live migration failed {e}"
                    ));
                }
                Some(Err(oneshot::error::TryRecvError::Closed)) => {
                    error!(log, "migration job task exited without a result");
                    return MigrationOutcome::Failed(
                        "migration job exited without a result".to_string(),
                    );
                }
            }

            let info = match domain.job_info().await {
                Ok(info) => info,
                Err(e) if job_started => {
                    // The job already returned successfully; a domain that
                    // has moved away can no longer report on it.
                    info!(log, "job info unavailable after migration job \
                        finished"; "error" => %e);
                    return MigrationOutcome::Completed;
                }
                Err(e) => {
                    error!(log, "failed to get domain job info"; "error" => %e);
                    return MigrationOutcome::Failed(format!(
                        "failed to get domain job info: {e}"
                    ));
                }
            };

            match info.state {
                JobState::Unbounded => {
                    let now = Instant::now();
                    if let Some(stall) =
                        tracker.observe(now, info.data_remaining)
                    {
                        warn!(log, "aborting live migration";
                            "reason" => stall.reason());
                        if let Err(e) = domain.abort_job().await {
                            error!(log, "failed to abort migration";
                                "error" => %e);
                        }
                        return MigrationOutcome::Aborted(stall.reason());
                    }
                    debug!(log, "migration in progress";
                        "data_remaining" => info.data_remaining,
                        "watermark" => tracker.watermark());
                }
                JobState::None if job_started => {
                    // The job returned successfully and the hypervisor has
                    // already dropped it.
                    info!(log, "migration job returned and is gone");
                    return MigrationOutcome::Completed;
                }
                JobState::None => {
                    info!(log, "migration job didn't start yet");
                }
                JobState::Bounded => {}
                JobState::Completed => {
                    info!(log, "migration has been completed");
                    return MigrationOutcome::Completed;
                }
                JobState::Failed => {
                    info!(log, "migration job failed");
                    return MigrationOutcome::Failed(
                        "migration job failed".to_string(),
                    );
                }
                JobState::Cancelled => {
                    info!(log, "migration was cancelled");
                    return MigrationOutcome::Aborted(
                        "Live migration aborted".to_string(),
                    );
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
