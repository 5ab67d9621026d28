use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::MissedTickBehavior;

use crate::config::AppConfig;
use crate::db::account_pool::AccountPool;
use crate::db::job_store::JobStore;
use crate::db::StoreError;
use crate::models::account::{Account, AccountKind};
use crate::models::job::{GenerationJob, JobKind, JobStatus};
use crate::services::allocator::AccountAllocator;
use crate::services::executor::{CancelFlag, ExecOutcome, TaskExecutor};

/// Metered accounts observed below this many credits after a run are cooled
/// down for the rest of the day; nothing meaningful fits in the remainder.
pub const LOW_BALANCE_THRESHOLD: i64 = 4;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upward notifications for anything watching the scheduler (CLI frontends,
/// tests). Lossy by design: a slow subscriber misses events, the scheduler
/// never blocks on one.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    JobStarted {
        job_id: i64,
        kind: JobKind,
        account_id: i64,
    },
    JobFinished {
        job_id: i64,
        kind: JobKind,
        success: bool,
    },
    StatusChanged {
        job_id: i64,
        status: JobStatus,
    },
}

/// Polls the job store and fans claimed jobs out to a bounded worker pool,
/// one executor per job kind. All collaborators are injected; the scheduler
/// owns no I/O of its own beyond the stores it is handed.
pub struct Scheduler {
    jobs: JobStore,
    accounts: AccountPool,
    allocator: Arc<AccountAllocator>,
    executors: HashMap<JobKind, Arc<dyn TaskExecutor>>,
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    poll_interval: Duration,
    events: broadcast::Sender<SchedulerEvent>,
    cancel: CancelFlag,
}

impl Scheduler {
    pub fn new(
        jobs: JobStore,
        accounts: AccountPool,
        allocator: AccountAllocator,
        executors: Vec<Arc<dyn TaskExecutor>>,
        config: &AppConfig,
    ) -> Self {
        let executors: HashMap<JobKind, Arc<dyn TaskExecutor>> =
            executors.into_iter().map(|e| (e.kind(), e)).collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs,
            accounts,
            allocator: Arc::new(allocator),
            executors,
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            max_workers: config.max_workers,
            poll_interval: config.poll_interval(),
            events,
            cancel: CancelFlag::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Main loop. Ticks until the shutdown watch flips to true, then raises
    /// the cancel flag and waits for in-flight workers to drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.dispatch_round().await {
                        tracing::error!(error = %e, "dispatch round failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("shutdown requested, draining in-flight jobs");
        self.cancel.raise();
        // Every worker holds one permit; owning all of them means the pool
        // is empty.
        let _drained = self
            .semaphore
            .acquire_many(self.max_workers as u32)
            .await;
        tracing::info!("scheduler stopped");
    }

    /// One poll: per registered executor, pull as many pending jobs as there
    /// are free workers, pair each with an account and dispatch.
    async fn dispatch_round(&self) -> Result<(), StoreError> {
        gauge!("genfarm_jobs_queued").set(self.jobs.count_queued().await? as f64);

        for (kind, executor) in &self.executors {
            let free = self.semaphore.available_permits();
            if free == 0 {
                return Ok(());
            }
            let pending = self.jobs.fetch_pending(*kind, free as i64).await?;
            for job in pending {
                let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                    return Ok(());
                };

                let required = executor.required_quota(&job);
                let Some(account) = self.allocator.allocate(required).await? else {
                    tracing::debug!(job_id = job.id, kind = %kind, required, "no account available, job stays queued");
                    continue;
                };

                // Conditional on still being Queued; a concurrent admin
                // action (delete, manual dispatch) loses the race cleanly.
                if !self.jobs.claim(job.id, account.id).await? {
                    tracing::debug!(job_id = job.id, "claim lost, skipping");
                    continue;
                }

                self.spawn_worker(job, account, executor.clone(), permit);
            }
        }

        Ok(())
    }

    fn spawn_worker(
        &self,
        job: GenerationJob,
        account: Account,
        executor: Arc<dyn TaskExecutor>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let jobs = self.jobs.clone();
        let accounts = self.accounts.clone();
        let allocator = self.allocator.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let kind = job.kind;
            tracing::info!(job_id = job.id, kind = %kind, account_id = account.id, "job started");
            counter!("genfarm_jobs_started_total", "kind" => kind.to_string()).increment(1);
            let _ = events.send(SchedulerEvent::JobStarted {
                job_id: job.id,
                kind,
                account_id: account.id,
            });
            let _ = events.send(SchedulerEvent::StatusChanged {
                job_id: job.id,
                status: JobStatus::Running,
            });

            let outcome = executor.execute(&job, &account, cancel).await;

            if let Err(e) = settle(&jobs, &accounts, &allocator, &events, &job, &account, outcome).await
            {
                tracing::error!(job_id = job.id, error = %e, "failed to persist job outcome");
            }
        });
    }
}

/// Persist one execution outcome and its account-side effects.
async fn settle(
    jobs: &JobStore,
    accounts: &AccountPool,
    allocator: &AccountAllocator,
    events: &broadcast::Sender<SchedulerEvent>,
    job: &GenerationJob,
    account: &Account,
    outcome: ExecOutcome,
) -> Result<(), StoreError> {
    match outcome {
        ExecOutcome::Completed {
            mut outputs,
            session,
        } => {
            outputs.truncate(job.kind.max_outputs());
            jobs.complete(job.id, &outputs).await?;
            accounts
                .record_session_result(account.id, session.credential.as_ref(), session.balance)
                .await?;

            if account.kind == AccountKind::Metered
                && session.balance.is_some_and(|b| b < LOW_BALANCE_THRESHOLD)
            {
                tracing::info!(
                    account_id = account.id,
                    balance = session.balance,
                    "balance below threshold, cooling account down for today"
                );
                allocator.disable_today(account.id).await?;
            }

            tracing::info!(job_id = job.id, outputs = outputs.len(), "job completed");
            counter!("genfarm_jobs_completed_total", "kind" => job.kind.to_string()).increment(1);
            let _ = events.send(SchedulerEvent::StatusChanged {
                job_id: job.id,
                status: JobStatus::Completed,
            });
            let _ = events.send(SchedulerEvent::JobFinished {
                job_id: job.id,
                kind: job.kind,
                success: true,
            });
        }

        ExecOutcome::QuotaExhausted { session } => {
            accounts
                .record_session_result(account.id, session.credential.as_ref(), session.balance)
                .await?;
            allocator.disable_today(account.id).await?;
            // Not a job failure: the job goes back to the queue unassigned
            // and a later round pairs it with a different account.
            jobs.requeue_for_quota(job.id).await?;

            tracing::warn!(
                job_id = job.id,
                account_id = account.id,
                "account out of quota, job requeued"
            );
            counter!("genfarm_quota_exhaustions_total").increment(1);
            let _ = events.send(SchedulerEvent::StatusChanged {
                job_id: job.id,
                status: JobStatus::Queued,
            });
            let _ = events.send(SchedulerEvent::JobFinished {
                job_id: job.id,
                kind: job.kind,
                success: false,
            });
        }

        ExecOutcome::Failed {
            kind,
            message,
            session,
        } => {
            if let Some(session) = session {
                accounts
                    .record_session_result(account.id, session.credential.as_ref(), session.balance)
                    .await?;
            }
            jobs.fail(job.id, kind, &message).await?;

            tracing::warn!(job_id = job.id, class = %kind, message, "job failed");
            counter!("genfarm_jobs_failed_total", "class" => kind.to_string()).increment(1);
            let _ = events.send(SchedulerEvent::StatusChanged {
                job_id: job.id,
                status: JobStatus::Failed,
            });
            let _ = events.send(SchedulerEvent::JobFinished {
                job_id: job.id,
                kind: job.kind,
                success: false,
            });
        }
    }

    Ok(())
}
