use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Whether an account carries a finite credit balance that must be checked
/// before allocation. Persisted as an integer code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Unmetered,
    Metered,
}

impl AccountKind {
    pub fn code(self) -> i64 {
        match self {
            AccountKind::Unmetered => 0,
            AccountKind::Metered => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AccountKind::Unmetered),
            1 => Some(AccountKind::Metered),
            _ => None,
        }
    }
}

/// Credential material for one automation identity: an interactive login pair
/// plus the browser cookies captured from the last session. Sites rotate
/// session cookies, so the freshest set is written back after every run.
///
/// Stored encrypted at rest; opaque to everything except the browser session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    pub email: String,
    pub password: String,
    /// CDP cookie objects as captured from the browser, kept as raw JSON so
    /// the orchestration core stays independent of the protocol types.
    #[serde(default)]
    pub cookies: serde_json::Value,
}

/// One automation identity usable to operate the remote site.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub credential: Credential,
    /// Remaining credit balance. Advisory only; the remote system is the
    /// source of truth (its quota rejection wins over this counter).
    pub quota_remaining: i64,
    pub kind: AccountKind,
    /// Cooldown marker: the account must not be selected while this date is
    /// today or later.
    pub disabled_until: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Whether the account may be selected on `today` (cooldown elapsed).
    pub fn is_available(&self, today: NaiveDate) -> bool {
        match self.disabled_until {
            Some(until) => until < today,
            None => true,
        }
    }
}
