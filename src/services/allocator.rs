use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::db::{AccountPool, JobStore, StoreError};
use crate::models::account::{Account, AccountKind};

/// Pluggable selection policy. Candidates arrive pre-filtered for cooldown
/// and soft-deletion; the strategy only decides which of them gets the job.
#[async_trait]
pub trait AllocationStrategy: Send + Sync {
    async fn select(
        &self,
        candidates: &[Account],
        jobs: &JobStore,
        required_quota: i64,
    ) -> Result<Option<Account>, StoreError>;
}

/// Quota-aware account selection. One allocator instance is shared by the
/// scheduler's workers; selection is advisory (see the quota note on
/// [`Account::quota_remaining`]).
pub struct AccountAllocator {
    accounts: AccountPool,
    jobs: JobStore,
    strategy: Box<dyn AllocationStrategy>,
}

impl AccountAllocator {
    pub fn new(accounts: AccountPool, jobs: JobStore) -> Self {
        Self::with_strategy(accounts, jobs, Box::new(QuotaFirst))
    }

    pub fn with_strategy(
        accounts: AccountPool,
        jobs: JobStore,
        strategy: Box<dyn AllocationStrategy>,
    ) -> Self {
        Self {
            accounts,
            jobs,
            strategy,
        }
    }

    /// Select a usable account for a job needing `required_quota` credits.
    /// Returns None when no account qualifies; the caller leaves the job
    /// Queued and tries again on the next poll.
    pub async fn allocate(&self, required_quota: i64) -> Result<Option<Account>, StoreError> {
        let today = Utc::now().date_naive();
        let candidates = filter_available(self.accounts.list().await?, today);

        if candidates.is_empty() {
            tracing::debug!("no accounts available for allocation");
            return Ok(None);
        }

        let selected = self
            .strategy
            .select(&candidates, &self.jobs, required_quota)
            .await?;

        if let Some(account) = &selected {
            tracing::debug!(
                account_id = account.id,
                quota_remaining = account.quota_remaining,
                required_quota,
                "allocated account"
            );
        }
        Ok(selected)
    }

    /// Cool an account down for the rest of the day after the remote system
    /// rejected it for insufficient quota.
    pub async fn disable_today(&self, account_id: i64) -> Result<(), StoreError> {
        self.accounts.disable_today(account_id).await
    }
}

/// Drop accounts whose cooldown date is today or later. Pure so the filter
/// invariant can be tested over arbitrary account sets.
pub fn filter_available(accounts: Vec<Account>, today: NaiveDate) -> Vec<Account> {
    accounts
        .into_iter()
        .filter(|a| a.is_available(today))
        .collect()
}

/// Default policy: metered accounts satisfying the quota requirement, highest
/// remaining quota first (ties by id ascending); if none qualify, fall back
/// to unmetered accounts oldest first, ignoring the requirement.
pub struct QuotaFirst;

/// The metered/unmetered preference as a pure function, shared by the trait
/// impl and the tests.
fn quota_first_pick(candidates: &[Account], required_quota: i64) -> Option<Account> {
    let metered = candidates
        .iter()
        .filter(|a| a.kind == AccountKind::Metered && a.quota_remaining >= required_quota)
        .max_by(|a, b| {
            a.quota_remaining
                .cmp(&b.quota_remaining)
                // Highest quota wins; on ties the lower id does.
                .then(b.id.cmp(&a.id))
        });
    if let Some(account) = metered {
        return Some(account.clone());
    }

    candidates
        .iter()
        .filter(|a| a.kind == AccountKind::Unmetered)
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
        .cloned()
}

#[async_trait]
impl AllocationStrategy for QuotaFirst {
    async fn select(
        &self,
        candidates: &[Account],
        _jobs: &JobStore,
        required_quota: i64,
    ) -> Result<Option<Account>, StoreError> {
        Ok(quota_first_pick(candidates, required_quota))
    }
}

/// Cycle through accounts in id order, continuing after the account used by
/// the most-recently-created job that got one. Falls back to the first
/// account when there is no history or the previous account is gone.
pub struct RoundRobin;

#[async_trait]
impl AllocationStrategy for RoundRobin {
    async fn select(
        &self,
        candidates: &[Account],
        jobs: &JobStore,
        _required_quota: i64,
    ) -> Result<Option<Account>, StoreError> {
        let mut ordered: Vec<&Account> = candidates.iter().collect();
        ordered.sort_by_key(|a| a.id);
        if ordered.is_empty() {
            return Ok(None);
        }

        let next = match jobs.last_assigned_account().await? {
            Some(last_id) => match ordered.iter().position(|a| a.id == last_id) {
                Some(index) => ordered[(index + 1) % ordered.len()],
                None => ordered[0],
            },
            None => ordered[0],
        };

        Ok(Some(next.clone()))
    }
}

/// Prefer the account with the fewest currently-Running jobs (ties by id
/// ascending).
pub struct LeastBusy;

#[async_trait]
impl AllocationStrategy for LeastBusy {
    async fn select(
        &self,
        candidates: &[Account],
        jobs: &JobStore,
        _required_quota: i64,
    ) -> Result<Option<Account>, StoreError> {
        let mut best: Option<(&Account, i64)> = None;
        for account in candidates {
            let running = jobs.count_running_for(account.id).await?;
            let better = match best {
                Some((current, count)) => {
                    running < count || (running == count && account.id < current.id)
                }
                None => true,
            };
            if better {
                best = Some((account, running));
            }
        }

        Ok(best.map(|(account, _)| account.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Credential;
    use chrono::{DateTime, Days, Utc};
    use rand::Rng;

    fn account(id: i64, kind: AccountKind, quota: i64, created_at: DateTime<Utc>) -> Account {
        Account {
            id,
            credential: Credential::default(),
            quota_remaining: quota,
            kind,
            disabled_until: None,
            created_at,
        }
    }

    #[test]
    fn filter_never_passes_cooled_down_accounts() {
        // Randomized account sets: the filter output must satisfy the
        // availability invariant regardless of quotas and cooldowns.
        let mut rng = rand::rng();
        let today = Utc::now().date_naive();

        for _ in 0..200 {
            let accounts: Vec<Account> = (0..rng.random_range(0..20))
                .map(|i| {
                    let mut a = account(
                        i,
                        if rng.random_bool(0.5) {
                            AccountKind::Metered
                        } else {
                            AccountKind::Unmetered
                        },
                        rng.random_range(0..100),
                        Utc::now(),
                    );
                    a.disabled_until = if rng.random_bool(0.5) {
                        let offset = rng.random_range(-5i64..5);
                        if offset >= 0 {
                            today.checked_add_days(Days::new(offset as u64))
                        } else {
                            today.checked_sub_days(Days::new(offset.unsigned_abs()))
                        }
                    } else {
                        None
                    };
                    a
                })
                .collect();

            for kept in filter_available(accounts, today) {
                assert!(kept.disabled_until.is_none_or(|d| d < today));
            }
        }
    }

    #[test]
    fn quota_first_prefers_highest_quota_then_lowest_id() {
        let now = Utc::now();
        let candidates = vec![
            account(1, AccountKind::Metered, 40, now),
            account(2, AccountKind::Metered, 90, now),
            account(3, AccountKind::Metered, 90, now),
            account(4, AccountKind::Unmetered, 0, now),
        ];

        let picked = quota_first_pick(&candidates, 10).unwrap();
        assert_eq!(picked.id, 2, "highest quota, lowest id on tie");
    }

    #[test]
    fn quota_first_falls_back_to_oldest_unmetered() {
        // Scenario A: sole metered account has 5 credits but 10 are needed.
        let now = Utc::now();
        let old = now.checked_sub_days(Days::new(3)).unwrap();
        let candidates = vec![
            account(1, AccountKind::Metered, 5, now),
            account(2, AccountKind::Unmetered, 0, now),
            account(3, AccountKind::Unmetered, 0, old),
        ];

        let picked = quota_first_pick(&candidates, 10).unwrap();
        assert_eq!(picked.id, 3, "oldest unmetered account wins the fallback");
    }

    #[test]
    fn quota_first_returns_none_when_nothing_qualifies() {
        let candidates = vec![account(1, AccountKind::Metered, 5, Utc::now())];
        assert!(quota_first_pick(&candidates, 10).is_none());
    }

    async fn memory_jobs() -> JobStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        crate::db::run_migrations(&pool).await.expect("migrations");
        JobStore::new(pool)
    }

    #[tokio::test]
    async fn round_robin_advances_and_wraps() {
        use crate::models::job::{JobKind, NewJob};

        let jobs = memory_jobs().await;
        let now = Utc::now();
        let candidates = vec![
            account(1, AccountKind::Unmetered, 0, now),
            account(2, AccountKind::Unmetered, 0, now),
            account(3, AccountKind::Unmetered, 0, now),
        ];

        // No history: start at the first account.
        let picked = RoundRobin.select(&candidates, &jobs, 0).await.unwrap();
        assert_eq!(picked.unwrap().id, 1);

        // Most recent assignment was account 3: wrap to account 1.
        let id = jobs.enqueue(NewJob::new(JobKind::Image, "x")).await.unwrap();
        jobs.claim(id, 3).await.unwrap();
        let picked = RoundRobin.select(&candidates, &jobs, 0).await.unwrap();
        assert_eq!(picked.unwrap().id, 1);

        // Previous account no longer present: reset to the first.
        let id = jobs.enqueue(NewJob::new(JobKind::Image, "y")).await.unwrap();
        jobs.claim(id, 99).await.unwrap();
        let picked = RoundRobin.select(&candidates, &jobs, 0).await.unwrap();
        assert_eq!(picked.unwrap().id, 1);

        // Account 2 was last: continue with account 3.
        let id = jobs.enqueue(NewJob::new(JobKind::Image, "z")).await.unwrap();
        jobs.claim(id, 2).await.unwrap();
        let picked = RoundRobin.select(&candidates, &jobs, 0).await.unwrap();
        assert_eq!(picked.unwrap().id, 3);
    }

    #[tokio::test]
    async fn least_busy_counts_running_jobs() {
        use crate::models::job::{JobKind, NewJob};

        let jobs = memory_jobs().await;
        let now = Utc::now();
        let candidates = vec![
            account(1, AccountKind::Unmetered, 0, now),
            account(2, AccountKind::Unmetered, 0, now),
        ];

        for _ in 0..2 {
            let id = jobs.enqueue(NewJob::new(JobKind::Image, "busy")).await.unwrap();
            jobs.claim(id, 1).await.unwrap();
        }

        let picked = LeastBusy.select(&candidates, &jobs, 0).await.unwrap();
        assert_eq!(picked.unwrap().id, 2);
    }
}
