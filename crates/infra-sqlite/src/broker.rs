// SQLite Broker Implementation

use crate::error::map_sqlx_error;
use crate::{create_pool, run_migrations};
use async_trait::async_trait;
use courier_core::domain::{
    FlowJob, FlowNode, Job, JobCounts, JobId, JobOptions, JobPayload, JobState, NewJob,
};
use courier_core::error::{AppError, Result};
use courier_core::port::id_provider::UuidProvider;
use courier_core::port::time_provider::SystemTimeProvider;
use courier_core::port::{Broker, BrokerConfig, FailureOutcome, IdProvider, TimeProvider};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable queue on a single SQLite database
///
/// Claiming is one `UPDATE ... RETURNING` statement, so two workers can never
/// receive the same job.
pub struct SqliteBroker {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_providers(pool, Arc::new(SystemTimeProvider), Arc::new(UuidProvider))
    }

    pub fn with_providers(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            id_provider,
        }
    }

    /// Open the database described by `config` and bring its schema up to date
    ///
    /// # Errors
    /// - AppError::Connection if the database cannot be opened
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Assign IDs depth-first, parent before its children
    fn stage_flow(
        &self,
        node: FlowNode,
        parent: Option<&JobId>,
        now: i64,
        staged: &mut Vec<Job>,
    ) -> FlowJob {
        let id = self.id_provider.generate_id();
        let mut job = Job::from_new(id.clone(), now, node.job);
        job.parent_id = parent.cloned();
        job.pending_children = node.children.len() as u32;
        if !node.children.is_empty() {
            job.state = JobState::WaitingChildren;
        }

        let summary = FlowJob {
            id: id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            children: Vec::new(),
        };
        staged.push(job);

        let children = node
            .children
            .into_iter()
            .map(|child| self.stage_flow(child, Some(&id), now, staged))
            .collect();
        FlowJob { children, ..summary }
    }

    async fn find_row(conn: &mut SqliteConnection, id: &JobId) -> Result<Option<JobRow>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_error)
    }

    /// Explain why an ACTIVE-only transition matched no row
    async fn not_active_error(conn: &mut SqliteConnection, id: &JobId) -> Result<AppError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        Ok(match state {
            None => AppError::NotFound(format!("Job {} not found", id)),
            Some(current) => {
                AppError::InvalidState(format!("Job {} is {}, expected ACTIVE", id, current))
            }
        })
    }
}

async fn insert_job(conn: &mut SqliteConnection, job: &Job) -> Result<()> {
    let options = serde_json::to_string(&job.options)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, name, queue, payload, options, priority, state,
            attempts_made, max_attempts, parent_id, pending_children,
            created_at, available_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.name)
    .bind(&job.queue)
    .bind(job.payload.as_value().to_string())
    .bind(options)
    .bind(job.priority())
    .bind(job.state.as_str())
    .bind(job.attempts_made as i64)
    .bind(job.max_attempts() as i64)
    .bind(&job.parent_id)
    .bind(job.pending_children as i64)
    .bind(job.created_at)
    .bind(job.available_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn add_job(&self, job: NewJob) -> Result<JobId> {
        let now = self.time_provider.now_millis();
        let job = Job::from_new(self.id_provider.generate_id(), now, job);

        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        insert_job(&mut conn, &job).await?;

        debug!(job_id = %job.id, queue = %job.queue, state = %job.state, "Job stored");
        Ok(job.id)
    }

    async fn add_flow(&self, flow: FlowNode) -> Result<FlowJob> {
        let now = self.time_provider.now_millis();
        let mut staged = Vec::with_capacity(flow.job_count());
        let flow_job = self.stage_flow(flow, None, now, &mut staged);

        // All-or-nothing: dropping the transaction on error rolls it back
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for job in &staged {
            insert_job(&mut tx, job).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(flow_id = %flow_job.id, jobs = staged.len(), "Flow stored");
        Ok(flow_job)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET state = 'ACTIVE', processed_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?
                  AND state IN ('WAITING', 'DELAYED')
                  AND available_at <= ?
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
              AND state IN ('WAITING', 'DELAYED')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn complete(&self, id: &JobId, return_value: serde_json::Value) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let updated: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET state = 'COMPLETED', return_value = ?, finished_at = ?
            WHERE id = ? AND state = 'ACTIVE'
            RETURNING parent_id
            "#,
        )
        .bind(return_value.to_string())
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some((parent_id,)) = updated else {
            return Err(Self::not_active_error(&mut tx, id).await?);
        };

        if let Some(parent_id) = parent_id {
            // Last child releases the parent to its queue
            let released: Option<(String,)> = sqlx::query_as(
                r#"
                UPDATE jobs
                SET pending_children = pending_children - 1,
                    state = CASE
                        WHEN pending_children <= 1 AND state = 'WAITING_CHILDREN' THEN 'WAITING'
                        ELSE state
                    END,
                    available_at = CASE
                        WHEN pending_children <= 1 AND state = 'WAITING_CHILDREN' THEN ?
                        ELSE available_at
                    END
                WHERE id = ? AND pending_children > 0
                RETURNING state
                "#,
            )
            .bind(now)
            .bind(&parent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if matches!(released, Some((ref state,)) if state == JobState::Waiting.as_str()) {
                info!(parent_id = %parent_id, "All children completed, parent released");
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fail(&self, id: &JobId, reason: &str) -> Result<FailureOutcome> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Write first: the transaction must hold the write lock before it reads
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET attempts_made = attempts_made + 1, failed_reason = ?
            WHERE id = ? AND state = 'ACTIVE'
            RETURNING *
            "#,
        )
        .bind(reason)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Err(Self::not_active_error(&mut tx, id).await?);
        };
        let job = row.into_job()?;
        let attempt = job.attempts_made;

        let outcome = if attempt < job.max_attempts() {
            let delay_ms = job
                .options
                .backoff
                .map(|b| b.delay_for(attempt))
                .unwrap_or(0);
            let state = if delay_ms > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            };
            let available_at = now.saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX));

            sqlx::query(
                r#"
                UPDATE jobs
                SET state = ?, available_at = ?, processed_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(state.as_str())
            .bind(available_at)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            FailureOutcome::Retrying { attempt, delay_ms }
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'FAILED', finished_at = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            if let (Some(parent_id), true) =
                (&job.parent_id, job.options.fail_parent_on_failure)
            {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'FAILED', failed_reason = ?, finished_at = ?
                    WHERE id = ? AND state = 'WAITING_CHILDREN'
                    "#,
                )
                .bind(format!("child {} failed: {}", id, reason))
                .bind(now)
                .bind(parent_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

                if result.rows_affected() > 0 {
                    warn!(parent_id = %parent_id, child_id = %id, "Parent failed by child");
                }
            }

            FailureOutcome::Failed
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        Self::find_row(&mut conn, id)
            .await?
            .map(JobRow::into_job)
            .transpose()
    }

    async fn children_values(&self, parent_id: &JobId) -> Result<HashMap<JobId, serde_json::Value>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, return_value FROM jobs WHERE parent_id = ? AND state = 'COMPLETED'",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|(id, value)| -> Result<(JobId, serde_json::Value)> {
                let value = match value {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => serde_json::Value::Null,
                };
                Ok((id, value))
            })
            .collect()
    }

    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = ?")
                .bind(queue)
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }

    async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = ? GROUP BY state")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            counts.set(state.parse()?, count);
        }
        Ok(counts)
    }

    async fn recover_stalled(&self, older_than_ms: i64) -> Result<u64> {
        let now = self.time_provider.now_millis();
        let cutoff = now.saturating_sub(older_than_ms);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'WAITING', processed_at = NULL, available_at = ?
            WHERE state = 'ACTIVE' AND processed_at <= ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn clean(&self, queue: &str, state: JobState, grace_ms: i64) -> Result<u64> {
        let cutoff = self.time_provider.now_millis().saturating_sub(grace_ms);

        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ? AND state = ? AND finished_at <= ?",
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    queue: String,
    payload: String,
    options: String,
    #[allow(dead_code)] // denormalized from options for the claim index
    priority: i64,
    state: String,
    attempts_made: i64,
    #[allow(dead_code)]
    max_attempts: i64,
    parent_id: Option<String>,
    pending_children: i64,
    failed_reason: Option<String>,
    return_value: Option<String>,
    created_at: i64,
    available_at: i64,
    processed_at: Option<i64>,
    finished_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let state: JobState = self.state.parse()?;
        let options: JobOptions = serde_json::from_str(&self.options)?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let return_value: Option<serde_json::Value> = self
            .return_value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Job {
            id: self.id,
            name: self.name,
            queue: self.queue,
            payload: JobPayload::new(payload),
            options,
            state,
            attempts_made: self.attempts_made.max(0) as u32,
            parent_id: self.parent_id,
            pending_children: self.pending_children.max(0) as u32,
            failed_reason: self.failed_reason,
            return_value,
            created_at: self.created_at,
            available_at: self.available_at,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
        })
    }
}
