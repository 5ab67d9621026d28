use headless_chrome::Tab;

use crate::models::account::Credential;
use crate::models::job::{GenerationJob, JobKind};
use crate::services::correlator::ResponseMatchers;

pub mod dreamina;

pub use dreamina::DreaminaScript;

/// A page interaction failed: element missing, navigation timeout, rejected
/// login. Carries the step name so failure messages point at the right part
/// of the sequence.
#[derive(Debug, thiserror::Error)]
#[error("{step}: {detail}")]
pub struct ScriptError {
    pub step: &'static str,
    pub detail: String,
}

impl ScriptError {
    pub fn new(step: &'static str, detail: impl ToString) -> Self {
        Self {
            step,
            detail: detail.to_string(),
        }
    }
}

/// Site-specific sequence of page interactions plus the response shapes to
/// watch for. The orchestration core treats this as an opaque, swappable
/// dependency: porting to another generation site means implementing this
/// trait, nothing else.
pub trait UiScript: ResponseMatchers {
    /// Short site label for logs.
    fn site(&self) -> &'static str;

    fn login_url(&self) -> &'static str;

    /// The generation surface for a job kind.
    fn surface_url(&self, kind: JobKind) -> &'static str;

    /// Whether `url` is the site's login (or logged-out error) page, i.e. a
    /// navigation there means the session is not authenticated.
    fn is_login_page(&self, url: &str) -> bool;

    /// Quick probe for an already-authenticated session (e.g. after cookie
    /// restore).
    fn is_logged_in(&self, tab: &Tab) -> bool;

    /// Interactive login with the stored credential pair.
    fn login(&self, tab: &Tab, credential: &Credential) -> Result<(), ScriptError>;

    /// Supply prompt, reference inputs and parameters, then trigger
    /// submission. The acknowledgement is observed by the correlator, not
    /// returned here.
    fn fill_and_submit(&self, tab: &Tab, job: &GenerationJob) -> Result<(), ScriptError>;
}
