use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::StoreError;
use crate::models::job::{FailureKind, GenerationJob, JobKind, JobStatus, NewJob};

/// Persisted job queue. The only durable job state in the system; every
/// mutation bumps `updated_at` in the same statement.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new job in Queued state with no account.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO generation_jobs
                (kind, prompt, input_refs, params, status, max_retry, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.kind.to_string())
        .bind(&job.prompt)
        .bind(serde_json::to_string(&job.input_refs)?)
        .bind(serde_json::to_string(&job.params)?)
        .bind(job.max_retry)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Get a job by id. Soft-deleted jobs are invisible.
    pub async fn get(&self, job_id: i64) -> Result<Option<GenerationJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM generation_jobs WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Queued jobs of one kind, oldest first (FIFO within a kind, ties broken
    /// by id ascending). No ordering guarantee across kinds.
    pub async fn fetch_pending(
        &self,
        kind: JobKind,
        limit: i64,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM generation_jobs
            WHERE kind = ? AND status = 0 AND deleted = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(kind.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Atomically move a Queued job to Running with an assigned account.
    /// Returns false if the job was no longer Queued (claimed elsewhere or
    /// deleted), in which case the caller must not dispatch it.
    pub async fn claim(&self, job_id: i64, account_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 1, account_id = ?, updated_at = ?
            WHERE id = ? AND status = 0 AND deleted = 0
            "#,
        )
        .bind(account_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update job status, optionally recording an error message.
    pub async fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = ?, error_message = COALESCE(?, error_message), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.code())
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the remote correlation id once the submission is acknowledged.
    pub async fn set_remote_id(&self, job_id: i64, remote_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs SET remote_id = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(remote_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal success: record output locators (in received order) and clear
    /// any stale failure fields.
    pub async fn complete(&self, job_id: i64, outputs: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 2, output_refs = ?, failure_kind = NULL, error_message = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(outputs)?)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal failure with its classification and a human-readable message.
    pub async fn fail(
        &self,
        job_id: i64,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 3, failure_kind = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(kind.to_string())
        .bind(message)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Assign an account to a job (the transient pre-dispatch step).
    pub async fn assign_account(&self, job_id: i64, account_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs SET account_id = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(account_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_account(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs SET account_id = NULL, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Quota-exhaustion recovery: the remote system rejected the account, so
    /// the job goes back to the queue unassigned. Not counted as a failure.
    pub async fn requeue_for_quota(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 0, account_id = NULL, remote_id = NULL,
                failure_kind = NULL, error_message = 'account quota exhausted, requeued',
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Explicit retry. Only jobs that failed with a transient class and still
    /// have retry budget are requeued; everything else is a no-op returning
    /// false. The job state is fully reset (correlation id, outputs, failure
    /// fields, account) and retry_count is incremented.
    pub async fn retry(&self, job_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 0, retry_count = retry_count + 1, account_id = NULL,
                remote_id = NULL, output_refs = '[]', failure_kind = NULL,
                error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 3 AND deleted = 0
              AND retry_count < max_retry
              AND failure_kind IN ('WEB_INTERACTION_FAILED', 'TASK_ID_NOT_OBTAINED')
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Startup reconciliation: bulk-transition every Running job back to
    /// Queued. Invoked once before the scheduler starts so jobs orphaned by
    /// an abnormal shutdown are picked up again.
    pub async fn reset_stale_running_jobs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 0, account_id = NULL, updated_at = ?
            WHERE status = 1
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Account used by the most-recently-created job that got one. Input to
    /// the round-robin allocation strategy.
    pub async fn last_assigned_account(&self) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id FROM generation_jobs
            WHERE account_id IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => r.try_get("account_id")?,
            None => None,
        })
    }

    /// Number of Running jobs currently assigned to an account. Input to the
    /// least-busy allocation strategy.
    pub async fn count_running_for(&self, account_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM generation_jobs
            WHERE account_id = ? AND status = 1 AND deleted = 0
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("n")?)
    }

    /// Number of Queued jobs across all kinds (queue-depth gauge).
    pub async fn count_queued(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM generation_jobs WHERE status = 0 AND deleted = 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("n")?)
    }

    /// Paged listing for external consumers (GUI/API), newest first.
    pub async fn list_page(
        &self,
        kind: JobKind,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<GenerationJob>, i64), StoreError> {
        let page = page.max(1);
        let total = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM generation_jobs WHERE kind = ? AND deleted = 0
            "#,
        )
        .bind(kind.to_string())
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("n")?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM generation_jobs
            WHERE kind = ? AND deleted = 0
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(kind.to_string())
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<_, _>>()?;
        Ok((jobs, total))
    }

    /// Soft-delete (administrative; the core never deletes jobs itself).
    pub async fn mark_deleted(&self, job_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs SET deleted = 1, updated_at = ? WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn job_from_row(row: &SqliteRow) -> Result<GenerationJob, StoreError> {
    let id: i64 = row.try_get("id")?;

    let kind: String = row.try_get("kind")?;
    let kind = kind
        .parse::<JobKind>()
        .map_err(|_| StoreError::Corrupt(id, "kind"))?;

    let status_code: i64 = row.try_get("status")?;
    let status = JobStatus::from_code(status_code).ok_or(StoreError::Corrupt(id, "status"))?;

    let failure_kind = row
        .try_get::<Option<String>, _>("failure_kind")?
        .map(|s| s.parse::<FailureKind>())
        .transpose()
        .map_err(|_| StoreError::Corrupt(id, "failure_kind"))?;

    let input_refs: String = row.try_get("input_refs")?;
    let output_refs: String = row.try_get("output_refs")?;
    let params: String = row.try_get("params")?;

    Ok(GenerationJob {
        id,
        kind,
        prompt: row.try_get("prompt")?,
        input_refs: serde_json::from_str(&input_refs)?,
        params: serde_json::from_str(&params)?,
        status,
        account_id: row.try_get("account_id")?,
        remote_id: row.try_get("remote_id")?,
        output_refs: serde_json::from_str(&output_refs)?,
        retry_count: row.try_get("retry_count")?,
        max_retry: row.try_get("max_retry")?,
        failure_kind,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> JobStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        crate::db::run_migrations(&pool).await.expect("migrations");
        JobStore::new(pool)
    }

    #[tokio::test]
    async fn fetch_pending_is_fifo_within_kind() {
        let store = memory_store().await;
        let first = store
            .enqueue(NewJob::new(JobKind::Image, "first"))
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::new(JobKind::Image, "second"))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new(JobKind::Video, "other kind"))
            .await
            .unwrap();

        let pending = store.fetch_pending(JobKind::Image, 10).await.unwrap();
        assert_eq!(
            pending.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first, second]
        );
    }

    #[tokio::test]
    async fn claim_moves_queued_to_running_exactly_once() {
        let store = memory_store().await;
        let id = store
            .enqueue(NewJob::new(JobKind::Image, "claim me"))
            .await
            .unwrap();

        assert!(store.claim(id, 7).await.unwrap());
        assert!(!store.claim(id, 8).await.unwrap(), "already Running");

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.account_id, Some(7));
    }

    #[tokio::test]
    async fn retry_resets_state_and_counts() {
        let store = memory_store().await;
        let id = store
            .enqueue(NewJob::new(JobKind::Image, "flaky"))
            .await
            .unwrap();
        store.claim(id, 1).await.unwrap();
        store.set_remote_id(id, "abc123").await.unwrap();
        store
            .fail(id, FailureKind::WebInteractionFailed, "element missing")
            .await
            .unwrap();

        assert!(store.retry(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.account_id, None);
        assert_eq!(job.remote_id, None);
        assert_eq!(job.failure_kind, None);
        assert_eq!(job.error_message, None);
    }

    #[tokio::test]
    async fn retry_refuses_remote_side_failures() {
        let store = memory_store().await;
        let id = store
            .enqueue(NewJob::new(JobKind::Video, "doomed"))
            .await
            .unwrap();
        store.claim(id, 1).await.unwrap();
        store
            .fail(id, FailureKind::GenerationFailed, "never finished")
            .await
            .unwrap();

        let before = store.get(id).await.unwrap().unwrap();
        assert!(!store.retry(id).await.unwrap());
        let after = store.get(id).await.unwrap().unwrap();

        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.retry_count, before.retry_count);
        assert_eq!(after.error_message.as_deref(), Some("never finished"));
    }

    #[tokio::test]
    async fn reset_stale_running_jobs_requeues_and_unassigns() {
        let store = memory_store().await;
        let a = store.enqueue(NewJob::new(JobKind::Image, "a")).await.unwrap();
        let b = store.enqueue(NewJob::new(JobKind::Image, "b")).await.unwrap();
        store.claim(a, 1).await.unwrap();
        store.claim(b, 2).await.unwrap();
        store.complete(b, &["u".to_string()]).await.unwrap();

        assert_eq!(store.reset_stale_running_jobs().await.unwrap(), 1);

        let job = store.get(a).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.account_id, None);

        // Completed jobs are untouched.
        let done = store.get(b).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }
}
