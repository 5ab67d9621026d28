use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::services::executor::CancelFlag;

/// One background network response observed inside the browser session,
/// reduced to what the matchers need. Produced by the session's response
/// handler; responses with non-JSON bodies are dropped at the source.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub url: String,
    pub body: serde_json::Value,
}

/// Typed matchers over intercepted responses. Implemented by the UI action
/// script, since the response shapes belong to the remote site; the
/// correlator itself is transport- and site-agnostic.
pub trait ResponseMatchers: Send + Sync {
    /// Submission acknowledgement: returns the remote job id when the
    /// response is the remote system accepting our submission.
    fn match_submission_ack(&self, response: &InterceptedResponse) -> Option<String>;

    /// Asset-listing entry for `remote_id` with its completion marker set.
    /// `Some(vec![])` means the remote operation finished but no output
    /// locators could be parsed (a remote-side failure).
    fn match_completed_asset(
        &self,
        response: &InterceptedResponse,
        remote_id: &str,
    ) -> Option<Vec<String>>;

    /// The remote system rejecting the account for insufficient quota.
    fn match_quota_rejection(&self, response: &InterceptedResponse) -> bool;

    /// Credit-balance readings the page happens to report.
    fn match_credit_balance(&self, response: &InterceptedResponse) -> Option<i64>;
}

/// Why a bounded wait ended without its match.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WaitError {
    #[error("timed out waiting for the remote response")]
    Timeout,

    #[error("remote system rejected the account for insufficient quota")]
    QuotaRejected,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("response stream closed (browser session gone)")]
    StreamClosed,

    #[error("page reload failed: {0}")]
    Reload(String),
}

/// Granularity of the blocking receive, so cancellation and deadlines are
/// honored promptly even when the page goes quiet.
const RECV_STEP: Duration = Duration::from_millis(250);

/// Correlates a remotely-assigned job identifier with eventual artifacts by
/// watching the network responses the page itself makes. Submission and
/// completion arrive on unrelated push-style channels with no query-by-id
/// endpoint, so observing traffic is the only reliable signal.
///
/// Fed from an [`InterceptedResponse`] channel, which makes it fully testable
/// without a browser.
pub struct CompletionCorrelator {
    rx: Receiver<InterceptedResponse>,
    matchers: Arc<dyn ResponseMatchers>,
    last_balance: Option<i64>,
    quota_rejected: bool,
}

impl CompletionCorrelator {
    pub fn new(rx: Receiver<InterceptedResponse>, matchers: Arc<dyn ResponseMatchers>) -> Self {
        Self {
            rx,
            matchers,
            last_balance: None,
            quota_rejected: false,
        }
    }

    /// Freshest credit balance observed in any response so far.
    pub fn last_balance(&self) -> Option<i64> {
        self.last_balance
    }

    /// Ambient signals present in every response, regardless of which wait is
    /// in progress.
    fn absorb(&mut self, response: &InterceptedResponse) {
        if let Some(balance) = self.matchers.match_credit_balance(response) {
            tracing::debug!(balance, "observed credit balance");
            self.last_balance = Some(balance);
        }
        if self.matchers.match_quota_rejection(response) {
            tracing::warn!(url = %response.url, "remote quota rejection observed");
            self.quota_rejected = true;
        }
    }

    /// Block until the submission acknowledgement carrying the remote job id
    /// arrives, the deadline passes, quota is rejected, or shutdown begins.
    pub fn await_acknowledgement(
        &mut self,
        deadline: Instant,
        cancel: &CancelFlag,
    ) -> Result<String, WaitError> {
        loop {
            if cancel.is_raised() {
                return Err(WaitError::Cancelled);
            }
            if self.quota_rejected {
                return Err(WaitError::QuotaRejected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }

            match self.rx.recv_timeout(RECV_STEP.min(deadline - now)) {
                Ok(response) => {
                    self.absorb(&response);
                    if let Some(remote_id) = self.matchers.match_submission_ack(&response) {
                        tracing::info!(remote_id = %remote_id, "submission acknowledged");
                        return Ok(remote_id);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::StreamClosed),
            }
        }
    }

    /// Block until the asset listing reports the entry for `remote_id` as
    /// finished, reloading the page every `reload_interval` to provoke fresh
    /// listings. Returns the output locators in the order received (possibly
    /// empty when the remote operation finished without parseable outputs).
    pub fn await_completion(
        &mut self,
        remote_id: &str,
        deadline: Instant,
        reload_interval: Duration,
        cancel: &CancelFlag,
        reload: &mut dyn FnMut() -> Result<(), String>,
    ) -> Result<Vec<String>, WaitError> {
        let mut last_reload = Instant::now();
        loop {
            if cancel.is_raised() {
                return Err(WaitError::Cancelled);
            }
            if self.quota_rejected {
                return Err(WaitError::QuotaRejected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            if now.duration_since(last_reload) >= reload_interval {
                reload().map_err(WaitError::Reload)?;
                last_reload = Instant::now();
            }

            match self.rx.recv_timeout(RECV_STEP.min(deadline - now)) {
                Ok(response) => {
                    self.absorb(&response);
                    if let Some(outputs) = self.matchers.match_completed_asset(&response, remote_id)
                    {
                        tracing::info!(
                            remote_id = %remote_id,
                            outputs = outputs.len(),
                            "remote operation finished"
                        );
                        return Ok(outputs);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::StreamClosed),
            }
        }
    }
}
