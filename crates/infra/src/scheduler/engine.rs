//! Cron trigger loops and supervised job execution.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use mailforge_core::{
    ExecutionOutcome, ExecutionStatus, JobExecutionLog, JobSchedule, ScheduleUpdate,
};

use super::job::{CronJob, RunOutcome, SchedulerError, new_schedule, next_fire, parse_schedule};
use crate::store::{ScheduleStore, StoreError};
use crate::util::panic_message;

/// Pause before re-reading a schedule that is invalid or has no upcoming fire time.
const INVALID_SCHEDULE_RETRY: Duration = Duration::from_secs(60);

struct RegisteredJob {
    job: Arc<dyn CronJob>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a run ends, including by panic or cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Runs registered [`CronJob`]s on their stored schedules.
pub struct CronScheduler<S> {
    store: Arc<S>,
    jobs: RwLock<BTreeMap<String, Arc<RegisteredJob>>>,
    running: Mutex<Option<Running>>,
}

impl<S: ScheduleStore + 'static> CronScheduler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            jobs: RwLock::new(BTreeMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Add a job. Jobs registered after [`start`](Self::start) get their
    /// trigger loop on the next start.
    pub fn register(&self, job: Arc<dyn CronJob>) -> Result<(), SchedulerError> {
        parse_schedule(job.schedule())?;
        let name = job.name().to_string();

        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        if jobs.contains_key(&name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        info!(job = %name, schedule = job.schedule(), "cron job registered");
        jobs.insert(
            name,
            Arc::new(RegisteredJob {
                job,
                in_flight: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.registered().keys().cloned().collect()
    }

    /// Seed missing schedule rows and spawn one trigger loop per job.
    /// A no-op while already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.lock_running().is_some() {
            warn!("scheduler already running");
            return Ok(());
        }

        let jobs: Vec<Arc<RegisteredJob>> = self.registered().values().cloned().collect();
        for entry in &jobs {
            self.store
                .create_schedule_if_absent(new_schedule(entry.job.as_ref()))
                .await?;
        }

        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let handles = jobs
            .into_iter()
            .map(|entry| {
                let span = info_span!("cron_job", job = %entry.job.name());
                tokio::spawn(
                    trigger_loop(self.store.clone(), entry, token.child_token()).instrument(span),
                )
            })
            .collect::<Vec<_>>();

        info!(jobs = handles.len(), "scheduler started");
        *running = Some(Running { token, handles });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Stop all trigger loops, waiting up to `timeout` for runs in progress.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), SchedulerError> {
        let Some(running) = self.lock_running().take() else {
            return Ok(());
        };
        running.token.cancel();

        match tokio::time::timeout(timeout, join_all(running.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "cron trigger loop terminated abnormally");
                    }
                }
                info!("scheduler stopped");
                Ok(())
            }
            Err(_) => {
                error!(?timeout, "cron jobs did not stop in time");
                Err(SchedulerError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Run `name` now through the same supervised path as a cron tick.
    pub async fn trigger_now(&self, name: &str) -> Result<RunOutcome, SchedulerError> {
        let entry = self
            .registered()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        run_supervised(self.store.as_ref(), &entry)
            .instrument(info_span!("cron_job", job = %name, manual = true))
            .await
    }

    pub async fn enable_job(&self, name: &str) -> Result<JobSchedule, SchedulerError> {
        self.set_enabled(name, true).await
    }

    pub async fn disable_job(&self, name: &str) -> Result<JobSchedule, SchedulerError> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<JobSchedule, SchedulerError> {
        let schedule = self
            .store
            .set_enabled(name, enabled)
            .await
            .map_err(|e| unknown_job(name, e))?;
        info!(job = %name, enabled, "cron job toggled");
        Ok(schedule)
    }

    /// Change the stored schedule of `name`. Takes effect at the job's next tick.
    pub async fn update_schedule(
        &self,
        name: &str,
        update: ScheduleUpdate,
    ) -> Result<JobSchedule, SchedulerError> {
        if let Some(cron) = &update.cron_schedule {
            parse_schedule(cron)?;
        }
        if let Some(retries) = update.max_retries {
            if retries < 0 {
                return Err(SchedulerError::InvalidSetting(format!(
                    "max_retries must not be negative, got {retries}"
                )));
            }
        }

        let schedule = self
            .store
            .update_schedule(name, &update)
            .await
            .map_err(|e| unknown_job(name, e))?;
        info!(
            job = %name,
            cron = %schedule.cron_schedule,
            timeout_seconds = schedule.timeout_seconds,
            max_retries = schedule.max_retries,
            "cron schedule updated"
        );
        Ok(schedule)
    }

    /// Most recent executions of `name`, newest first.
    pub async fn job_history(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<JobExecutionLog>, SchedulerError> {
        Ok(self.store.list_execution_history(name, limit).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<JobSchedule>, SchedulerError> {
        Ok(self.store.list_schedules().await?)
    }

    fn registered(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RegisteredJob>>> {
        self.jobs.read().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn unknown_job(name: &str, err: StoreError) -> SchedulerError {
    match err {
        StoreError::NotFound(_) => SchedulerError::UnknownJob(name.to_string()),
        other => SchedulerError::Store(other),
    }
}

async fn trigger_loop<S: ScheduleStore + 'static>(
    store: Arc<S>,
    entry: Arc<RegisteredJob>,
    token: CancellationToken,
) {
    let name = entry.job.name().to_string();
    debug!("trigger loop started");

    loop {
        // The stored expression wins so admin updates apply without restart.
        let expression = match store.get_schedule(&name).await {
            Ok(Some(schedule)) => schedule.cron_schedule,
            Ok(None) => entry.job.schedule().to_string(),
            Err(e) => {
                warn!(error = %e, "failed to read schedule; using job default");
                entry.job.schedule().to_string()
            }
        };

        let next = parse_schedule(&expression)
            .map_err(|e| e.to_string())
            .and_then(|s| {
                next_fire(&s, Utc::now()).ok_or_else(|| "no upcoming fire time".to_string())
            });
        let wait = match &next {
            Ok(at) => (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            Err(reason) => {
                error!(expression = %expression, %reason, "cron job cannot be scheduled");
                INVALID_SCHEDULE_RETRY
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if next.is_err() {
            continue;
        }

        match run_supervised(store.as_ref(), &entry).await {
            Ok(RunOutcome::Executed(log)) => debug!(status = %log.status, "cron tick handled"),
            Ok(RunOutcome::Disabled) => debug!("cron job disabled; tick skipped"),
            Ok(RunOutcome::Overlapping) => {}
            Err(e) => error!(error = %e, "cron tick failed"),
        }
    }

    debug!("trigger loop stopped");
}

/// One supervised run: ensure the schedule row, honor `enabled`, log the
/// execution and record its outcome.
async fn run_supervised<S: ScheduleStore + ?Sized>(
    store: &S,
    entry: &RegisteredJob,
) -> Result<RunOutcome, SchedulerError> {
    let job = entry.job.as_ref();
    let name = job.name();

    let Some(_in_flight) = InFlight::acquire(&entry.in_flight) else {
        warn!("previous run still in progress; skipping");
        return Ok(RunOutcome::Overlapping);
    };

    let schedule = match store.get_schedule(name).await? {
        Some(schedule) => schedule,
        None => store.create_schedule_if_absent(new_schedule(job)).await?,
    };
    if !schedule.enabled {
        return Ok(RunOutcome::Disabled);
    }

    let started_at = Utc::now();
    if let Err(e) = store.mark_run_started(name, started_at).await {
        warn!(error = %e, "failed to stamp last_run_at");
    }

    let mut log = JobExecutionLog::start(&schedule, started_at);
    let log_created = match store.create_execution_log(&log).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to create execution log; will write it after the run");
            false
        }
    };

    info!(timeout = ?schedule.effective_timeout(), "cron job started");
    let outcome = execute(job, schedule.effective_timeout(), schedule.max_retries).await;

    let stamp = if outcome.status.is_success() {
        store.mark_run_succeeded(name, outcome.finished_at).await
    } else {
        store.mark_run_failed(name, outcome.finished_at).await
    };
    if let Err(e) = stamp {
        warn!(error = %e, "failed to stamp run result");
    }

    if !log_created {
        if let Err(e) = store.create_execution_log(&log).await {
            error!(error = %e, "fallback execution log could not be written");
        }
    }
    if let Err(e) = store.finish_execution_log(log.id, &outcome).await {
        error!(error = %e, "failed to finish execution log");
    }
    log.finish(&outcome);

    match outcome.status {
        ExecutionStatus::Completed => {
            info!(duration_ms = outcome.duration_ms, "cron job completed")
        }
        status => error!(
            %status,
            duration_ms = outcome.duration_ms,
            error = outcome.error_message.as_deref().unwrap_or(""),
            "cron job did not complete"
        ),
    }

    Ok(RunOutcome::Executed(log))
}

/// Run `job` with a per-attempt timeout and panic boundary. Failed attempts
/// are retried up to `max_retries` times; a timeout ends the run.
async fn execute(job: &dyn CronJob, timeout: Duration, max_retries: i32) -> ExecutionOutcome {
    let started = Instant::now();
    let attempts = u32::try_from(max_retries).unwrap_or(0).saturating_add(1);

    let mut status = ExecutionStatus::Failed;
    let mut error_message = None;
    let mut output: Option<Value> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, AssertUnwindSafe(job.run()).catch_unwind()).await {
            Ok(Ok(Ok(result))) => {
                status = ExecutionStatus::Completed;
                error_message = None;
                output = result;
                break;
            }
            Ok(Ok(Err(e))) => {
                status = ExecutionStatus::Failed;
                error_message = Some(e.to_string());
            }
            Ok(Err(payload)) => {
                status = ExecutionStatus::Failed;
                error_message = Some(format!("job panicked: {}", panic_message(&*payload)));
            }
            Err(_) => {
                status = ExecutionStatus::Timeout;
                error_message = Some(format!("job exceeded timeout of {timeout:?}"));
                break;
            }
        }
        if attempt < attempts {
            warn!(attempt, error = error_message.as_deref().unwrap_or(""), "cron job attempt failed; retrying");
        }
    }

    ExecutionOutcome {
        status,
        finished_at: Utc::now(),
        duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
        error_message,
        output,
    }
}
