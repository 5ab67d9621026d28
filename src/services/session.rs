use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::account::Credential;
use crate::models::job::{GenerationJob, JobKind};
use crate::scripts::{ScriptError, UiScript};
use crate::services::correlator::{CompletionCorrelator, InterceptedResponse, WaitError};
use crate::services::executor::CancelFlag;

/// Where a generation session currently stands. One session exists per job
/// invocation; phases only move forward, with Error reachable from any of
/// them and Closed releasing the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Authenticated,
    PageReady,
    Submitted,
    AwaitingAck,
    AwaitingCompletion,
    Extracted,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("redirected to login page (session expired)")]
    NotAuthenticated,

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Per-session timing and browser knobs, resolved from `AppConfig` by the
/// executor that owns the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub headless: bool,
    pub sandbox: bool,
    pub ack_timeout: Duration,
    pub completion_timeout: Duration,
    pub reload_interval: Duration,
}

/// What a closed session hands back for persistence: rotated cookies (sites
/// rotate session tokens, so the freshest set must go back on the account)
/// and the last credit balance the page reported.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub credential: Option<Credential>,
    pub balance: Option<i64>,
}

/// A browser session driving one generation job through the remote UI.
///
/// All methods are blocking; executors run the whole session on a blocking
/// worker thread. The response stream feeding the correlator is the only
/// channel through which the remote system's acknowledgement and completion
/// are learned.
pub struct GenerationSession {
    _browser: Browser,
    tab: Arc<Tab>,
    correlator: CompletionCorrelator,
    script: Arc<dyn UiScript>,
    phase: SessionPhase,
}

impl GenerationSession {
    /// Launch a browser, open a tab and subscribe the correlator to every
    /// JSON response the page produces.
    pub fn launch(
        script: Arc<dyn UiScript>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(config.sandbox)
            // The default idle timeout would kill the browser under us while
            // we sit in the completion wait.
            .idle_browser_timeout(config.completion_timeout + Duration::from_secs(120))
            .build()
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let browser = Browser::new(options).map_err(|e| SessionError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<InterceptedResponse>();
        tab.register_response_handling(
            "completion-correlator",
            Box::new(move |params, fetch_body| {
                let url = params.response.url.clone();
                if !params.response.mime_type.contains("json") {
                    return;
                }
                let Ok(raw) = fetch_body() else {
                    return;
                };
                let text = if raw.base_64_encoded {
                    use base64::Engine;
                    match base64::engine::general_purpose::STANDARD
                        .decode(raw.body.as_bytes())
                        .map(String::from_utf8)
                    {
                        Ok(Ok(text)) => text,
                        _ => return,
                    }
                } else {
                    raw.body
                };
                if let Ok(body) = serde_json::from_str(&text) {
                    // The receiver disappears when the session closes; a
                    // failed send just means nobody is listening anymore.
                    let _ = tx.send(InterceptedResponse { url, body });
                }
            }),
        )
        .map_err(|e| SessionError::Launch(e.to_string()))?;

        let matchers: Arc<dyn crate::services::correlator::ResponseMatchers> = script.clone();
        let correlator = CompletionCorrelator::new(rx, matchers);

        Ok(Self {
            _browser: browser,
            tab,
            correlator,
            script,
            phase: SessionPhase::Init,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn advance(&mut self, phase: SessionPhase) {
        tracing::debug!(site = self.script.site(), from = ?self.phase, to = ?phase, "session phase");
        self.phase = phase;
    }

    /// Init -> Authenticated. Restores stored cookies and probes for a live
    /// session before falling back to interactive login.
    pub fn authenticate(&mut self, credential: &Credential) -> Result<(), SessionError> {
        if let Ok(cookies) = serde_json::from_value::<Vec<CookieParam>>(credential.cookies.clone())
        {
            if !cookies.is_empty() {
                self.tab
                    .set_cookies(cookies)
                    .map_err(|e| SessionError::Navigation(e.to_string()))?;
            }
        }

        self.navigate(self.script.login_url())?;

        if self.script.is_logged_in(&self.tab) {
            tracing::debug!(site = self.script.site(), "session restored from cookies");
        } else {
            tracing::info!(site = self.script.site(), "interactive login");
            self.script.login(&self.tab, credential)?;
        }

        self.advance(SessionPhase::Authenticated);
        Ok(())
    }

    /// Authenticated -> PageReady. Navigates to the generation surface and
    /// verifies the site did not bounce us back to login.
    pub fn open_surface(&mut self, kind: JobKind) -> Result<(), SessionError> {
        self.navigate(self.script.surface_url(kind))?;

        let here = self
            .tab
            .get_url();
        if self.script.is_login_page(&here) {
            return Err(SessionError::NotAuthenticated);
        }

        self.advance(SessionPhase::PageReady);
        Ok(())
    }

    /// PageReady -> Submitted. Supplies the job inputs and triggers
    /// submission through the UI action script.
    pub fn submit(&mut self, job: &GenerationJob) -> Result<(), SessionError> {
        self.script.fill_and_submit(&self.tab, job)?;
        self.advance(SessionPhase::Submitted);
        Ok(())
    }

    /// Submitted -> AwaitingAck -> (remote id known). Bounded by
    /// `ack_timeout`.
    pub fn await_acknowledgement(
        &mut self,
        config: &SessionConfig,
        cancel: &CancelFlag,
    ) -> Result<String, WaitError> {
        self.advance(SessionPhase::AwaitingAck);
        self.correlator
            .await_acknowledgement(Instant::now() + config.ack_timeout, cancel)
    }

    /// AwaitingCompletion -> Extracted. Reloads the page periodically so the
    /// asset listing refreshes; bounded by the per-kind completion timeout.
    pub fn await_completion(
        &mut self,
        remote_id: &str,
        config: &SessionConfig,
        cancel: &CancelFlag,
    ) -> Result<Vec<String>, WaitError> {
        self.advance(SessionPhase::AwaitingCompletion);
        let tab = self.tab.clone();
        let outputs = self.correlator.await_completion(
            remote_id,
            Instant::now() + config.completion_timeout,
            config.reload_interval,
            cancel,
            &mut || {
                tab.reload(false, None).map(|_| ()).map_err(|e| e.to_string())
            },
        )?;
        self.advance(SessionPhase::Extracted);
        Ok(outputs)
    }

    /// Any phase -> Closed. Captures rotated cookies and the last observed
    /// balance, then releases the browser.
    pub fn close(mut self, login: &Credential) -> SessionReport {
        self.advance(SessionPhase::Closed);

        let credential = self
            .tab
            .get_cookies()
            .ok()
            .and_then(|cookies| serde_json::to_value(cookies).ok())
            .map(|cookies| Credential {
                email: login.email.clone(),
                password: login.password.clone(),
                cookies,
            });

        SessionReport {
            credential,
            balance: self.correlator.last_balance(),
        }
    }

    fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|e| SessionError::Navigation(format!("{url}: {e}")))
    }
}
