use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::job_store::JobStore;
use crate::models::account::{Account, Credential};
use crate::models::job::{FailureKind, GenerationJob, JobKind, JobParams};
use crate::scripts::UiScript;
use crate::services::correlator::WaitError;
use crate::services::session::{GenerationSession, SessionConfig, SessionReport};

/// Cooperative cancellation shared between the scheduler and blocking
/// session work. Raised once on shutdown; never lowered.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal result of one execution attempt. Every variant that got far
/// enough to open a session carries the session report so the scheduler can
/// persist rotated credentials and the observed balance.
#[derive(Debug)]
pub enum ExecOutcome {
    Completed {
        outputs: Vec<String>,
        session: SessionReport,
    },
    QuotaExhausted {
        session: SessionReport,
    },
    Failed {
        kind: FailureKind,
        message: String,
        session: Option<SessionReport>,
    },
}

/// One executor per job kind. The scheduler only ever talks to this trait;
/// everything browser-shaped stays behind it.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Credits this job will consume, used by the allocator to pick an
    /// account that can afford it. Advisory: the remote system remains the
    /// authority and may still reject.
    fn required_quota(&self, job: &GenerationJob) -> i64;

    async fn execute(&self, job: &GenerationJob, account: &Account, cancel: CancelFlag)
        -> ExecOutcome;
}

/// Credit cost of a video generation. The 3.0 model line is priced by
/// duration; everything else is flat.
pub(crate) fn video_credit_cost(params: &JobParams) -> i64 {
    let model = params.model.as_deref().unwrap_or_default().to_lowercase();
    if !model.contains("video-3.0") {
        return 10;
    }
    let seconds = params
        .duration
        .as_deref()
        .unwrap_or_default()
        .to_lowercase()
        .replace('s', "")
        .trim()
        .parse::<i64>();
    match seconds {
        Ok(5) => 10,
        Ok(10) => 20,
        _ => 10,
    }
}

fn ack_failure(err: WaitError) -> (FailureKind, String) {
    match err {
        WaitError::Timeout => (
            FailureKind::TaskIdNotObtained,
            "submission was not acknowledged in time".into(),
        ),
        other => (FailureKind::WebInteractionFailed, other.to_string()),
    }
}

fn completion_failure(err: WaitError) -> (FailureKind, String) {
    match err {
        WaitError::Timeout => (
            FailureKind::GenerationFailed,
            "timed out waiting for generation to complete".into(),
        ),
        other => (FailureKind::WebInteractionFailed, other.to_string()),
    }
}

/// Drives one job through a full browser session. Blocking; runs on a
/// blocking worker thread. `ack_tx` fires as soon as the remote id is known
/// so it can be persisted while the generation is still in flight.
fn run_session(
    script: Arc<dyn UiScript>,
    config: SessionConfig,
    job: GenerationJob,
    credential: Credential,
    cancel: CancelFlag,
    ack_tx: tokio::sync::oneshot::Sender<String>,
) -> ExecOutcome {
    let mut session = match GenerationSession::launch(script, &config) {
        Ok(session) => session,
        Err(e) => {
            return ExecOutcome::Failed {
                kind: FailureKind::WebInteractionFailed,
                message: e.to_string(),
                session: None,
            }
        }
    };

    let steps = session
        .authenticate(&credential)
        .and_then(|()| session.open_surface(job.kind))
        .and_then(|()| session.submit(&job));
    if let Err(e) = steps {
        return ExecOutcome::Failed {
            kind: FailureKind::WebInteractionFailed,
            message: e.to_string(),
            session: Some(session.close(&credential)),
        };
    }

    let remote_id = match session.await_acknowledgement(&config, &cancel) {
        Ok(remote_id) => remote_id,
        Err(WaitError::QuotaRejected) => {
            return ExecOutcome::QuotaExhausted {
                session: session.close(&credential),
            }
        }
        Err(e) => {
            let (kind, message) = ack_failure(e);
            return ExecOutcome::Failed {
                kind,
                message,
                session: Some(session.close(&credential)),
            };
        }
    };
    // Receiver may already be gone if the scheduler is shutting down.
    let _ = ack_tx.send(remote_id.clone());

    match session.await_completion(&remote_id, &config, &cancel) {
        Ok(outputs) if outputs.is_empty() => ExecOutcome::Failed {
            kind: FailureKind::GenerationFailed,
            message: "remote generation finished without outputs".into(),
            session: Some(session.close(&credential)),
        },
        Ok(outputs) => ExecOutcome::Completed {
            outputs,
            session: session.close(&credential),
        },
        Err(WaitError::QuotaRejected) => ExecOutcome::QuotaExhausted {
            session: session.close(&credential),
        },
        Err(e) => {
            let (kind, message) = completion_failure(e);
            ExecOutcome::Failed {
                kind,
                message,
                session: Some(session.close(&credential)),
            }
        }
    }
}

/// Shared plumbing for the concrete executors: spawn the blocking session,
/// persist the remote id the moment the acknowledgement lands.
struct BrowserExecutor {
    script: Arc<dyn UiScript>,
    jobs: JobStore,
    config: SessionConfig,
}

impl BrowserExecutor {
    async fn run(&self, job: &GenerationJob, account: &Account, cancel: CancelFlag) -> ExecOutcome {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel::<String>();

        let jobs = self.jobs.clone();
        let job_id = job.id;
        let persist_ack = tokio::spawn(async move {
            if let Ok(remote_id) = ack_rx.await {
                if let Err(e) = jobs.set_remote_id(job_id, &remote_id).await {
                    tracing::warn!(job_id, error = %e, "failed to persist remote id");
                }
            }
        });

        let script = self.script.clone();
        let config = self.config.clone();
        let job = job.clone();
        let credential = account.credential.clone();
        let outcome =
            tokio::task::spawn_blocking(move || {
                run_session(script, config, job, credential, cancel, ack_tx)
            })
            .await;
        let _ = persist_ack.await;

        match outcome {
            Ok(outcome) => outcome,
            Err(e) => ExecOutcome::Failed {
                kind: FailureKind::WebInteractionFailed,
                message: format!("session worker panicked: {e}"),
                session: None,
            },
        }
    }
}

pub struct ImageExecutor {
    inner: BrowserExecutor,
}

impl ImageExecutor {
    pub fn new(script: Arc<dyn UiScript>, jobs: JobStore, config: &AppConfig) -> Self {
        Self {
            inner: BrowserExecutor {
                script,
                jobs,
                config: SessionConfig {
                    headless: config.headless,
                    sandbox: config.browser_sandbox,
                    ack_timeout: config.ack_timeout(),
                    completion_timeout: Duration::from_secs(config.image_timeout_seconds),
                    reload_interval: config.reload_interval(),
                },
            },
        }
    }
}

#[async_trait]
impl TaskExecutor for ImageExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Image
    }

    fn required_quota(&self, _job: &GenerationJob) -> i64 {
        0
    }

    async fn execute(
        &self,
        job: &GenerationJob,
        account: &Account,
        cancel: CancelFlag,
    ) -> ExecOutcome {
        self.inner.run(job, account, cancel).await
    }
}

pub struct VideoExecutor {
    inner: BrowserExecutor,
}

impl VideoExecutor {
    pub fn new(script: Arc<dyn UiScript>, jobs: JobStore, config: &AppConfig) -> Self {
        Self {
            inner: BrowserExecutor {
                script,
                jobs,
                config: SessionConfig {
                    headless: config.headless,
                    sandbox: config.browser_sandbox,
                    ack_timeout: config.ack_timeout(),
                    completion_timeout: Duration::from_secs(config.video_timeout_seconds),
                    reload_interval: config.reload_interval(),
                },
            },
        }
    }
}

#[async_trait]
impl TaskExecutor for VideoExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Video
    }

    fn required_quota(&self, job: &GenerationJob) -> i64 {
        video_credit_cost(&job.params)
    }

    async fn execute(
        &self,
        job: &GenerationJob,
        account: &Account,
        cancel: CancelFlag,
    ) -> ExecOutcome {
        self.inner.run(job, account, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_params(model: &str, duration: &str) -> JobParams {
        JobParams {
            model: Some(model.to_string()),
            ratio: None,
            resolution: None,
            duration: Some(duration.to_string()),
        }
    }

    #[test]
    fn video_3_is_priced_by_duration() {
        assert_eq!(video_credit_cost(&video_params("video-3.0", "5s")), 10);
        assert_eq!(video_credit_cost(&video_params("Video-3.0", "10s")), 20);
        assert_eq!(video_credit_cost(&video_params("video-3.0", "10")), 20);
    }

    #[test]
    fn unknown_duration_falls_back_to_flat_rate() {
        assert_eq!(video_credit_cost(&video_params("video-3.0", "8s")), 10);
        assert_eq!(video_credit_cost(&video_params("video-3.0", "soon")), 10);
    }

    #[test]
    fn other_models_cost_flat_rate() {
        assert_eq!(video_credit_cost(&video_params("video-2.1", "10s")), 10);
        assert_eq!(
            video_credit_cost(&JobParams::default()),
            10
        );
    }

    #[test]
    fn cancel_flag_is_sticky_across_clones() {
        let flag = CancelFlag::default();
        let seen_by_worker = flag.clone();
        assert!(!seen_by_worker.is_raised());
        flag.raise();
        assert!(seen_by_worker.is_raised());
    }

    #[test]
    fn ack_timeout_is_retryable_completion_timeout_is_not() {
        let (kind, _) = ack_failure(WaitError::Timeout);
        assert!(kind.is_retryable());
        let (kind, _) = completion_failure(WaitError::Timeout);
        assert!(!kind.is_retryable());
    }
}
