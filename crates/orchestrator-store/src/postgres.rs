//! PostgreSQL implementation of [`TaskStore`].
//!
//! Uses runtime `sqlx::query()` rather than the `query!` macros — the orchestrator ships
//! without a compile-time `DATABASE_URL`, so queries are checked at runtime against a
//! connection established from the same migrations this crate carries under `migrations/`.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::parse_and_clamp;
use crate::error::StoreError;
use crate::model::*;
use crate::store::{CircuitUpdate, TaskStore};

/// Tables the schema check requires to be present before the orchestrator will start.
const REQUIRED_TABLES: &[&str] = &[
    "tasks",
    "attempts",
    "workers",
    "worker_heartbeats",
    "task_claims",
    "execution_runs",
    "invocations",
    "circuit_breakers",
    "circuit_breaker_events",
    "config",
    "git_stash_log",
    "static_review_metrics",
];

/// Production persistence backend for the orchestrator, backed by a `sqlx::PgPool`.
///
/// # Example
///
/// ```ignore
/// use orchestrator_store::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/orchestrator").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.check_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verifies every table [`REQUIRED_TABLES`] names exists. Called at startup; a
    /// missing table is fatal — the orchestrator must not start against a database
    /// that hasn't run its migrations.
    #[instrument(skip(self))]
    pub async fn check_schema(&self) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
        )
        .fetch_all(&self.pool)
        .await?;
        let present: Vec<String> = rows.iter().map(|r| r.get::<String, _>("table_name")).collect();
        let missing: Vec<String> = REQUIRED_TABLES
            .iter()
            .filter(|t| !present.iter().any(|p| p == *t))
            .map(|t| t.to_string())
            .collect();
        if !missing.is_empty() {
            error!(?missing, "schema mismatch at startup");
            return Err(StoreError::SchemaMismatch { missing });
        }
        Ok(())
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
        let status: String = row.get("status");
        let acceptance_criteria: serde_json::Value = row.get("acceptance_criteria");
        let module_exports: serde_json::Value = row.get("module_exports");
        let depends_on: serde_json::Value = row.get("depends_on");
        Ok(Task {
            id: row.get("id"),
            task_key: row.get("task_key"),
            title: row.get("title"),
            goal: row.get("goal"),
            phase: row.get("phase"),
            sequence: row.get("sequence"),
            spec_id: row.get("spec_id"),
            test_file: row.get("test_file"),
            impl_file: row.get("impl_file"),
            verify_command: row.get("verify_command"),
            done_criteria: row.get("done_criteria"),
            acceptance_criteria: serde_json::from_value(acceptance_criteria)?,
            module_exports: serde_json::from_value(module_exports)?,
            depends_on: serde_json::from_value(depends_on)?,
            status: parse_task_status(&status)?,
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get("claimed_at"),
            claim_expires_at: row.get("claim_expires_at"),
            version: row.get("version"),
        })
    }

    fn row_to_circuit(row: &sqlx::postgres::PgRow) -> Result<CircuitBreakerRow, StoreError> {
        let level: String = row.get("level");
        let state: String = row.get("state");
        let config_snapshot: serde_json::Value = row.get("config_snapshot");
        Ok(CircuitBreakerRow {
            id: row.get("id"),
            level: parse_circuit_level(&level)?,
            identifier: row.get("identifier"),
            state: parse_circuit_state(&state)?,
            version: row.get("version"),
            failure_count: row.get("failure_count"),
            success_count: row.get("success_count"),
            half_open_requests: row.get("half_open_requests"),
            extensions_count: row.get("extensions_count"),
            opened_at: row.get("opened_at"),
            last_failure_at: row.get("last_failure_at"),
            last_success_at: row.get("last_success_at"),
            last_state_change_at: row.get("last_state_change_at"),
            run_id: row.get("run_id"),
            config_snapshot,
        })
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus, StoreError> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "passing" => Ok(TaskStatus::Passing),
        "complete" => Ok(TaskStatus::Complete),
        "blocked" => Ok(TaskStatus::Blocked),
        "blocked_static_review" => Ok(TaskStatus::BlockedStaticReview),
        other => Err(StoreError::Database(format!("unknown task status: {other}"))),
    }
}

fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Passing => "passing",
        TaskStatus::Complete => "complete",
        TaskStatus::Blocked => "blocked",
        TaskStatus::BlockedStaticReview => "blocked_static_review",
    }
}

fn parse_circuit_level(s: &str) -> Result<CircuitLevel, StoreError> {
    match s {
        "stage" => Ok(CircuitLevel::Stage),
        "worker" => Ok(CircuitLevel::Worker),
        "system" => Ok(CircuitLevel::System),
        other => Err(StoreError::Database(format!("unknown circuit level: {other}"))),
    }
}

fn circuit_level_str(l: CircuitLevel) -> &'static str {
    match l {
        CircuitLevel::Stage => "stage",
        CircuitLevel::Worker => "worker",
        CircuitLevel::System => "system",
    }
}

fn parse_circuit_state(s: &str) -> Result<CircuitState, StoreError> {
    match s {
        "closed" => Ok(CircuitState::Closed),
        "open" => Ok(CircuitState::Open),
        "half_open" => Ok(CircuitState::HalfOpen),
        other => Err(StoreError::Database(format!("unknown circuit state: {other}"))),
    }
}

fn circuit_event_type_str(e: CircuitEventType) -> &'static str {
    match e {
        CircuitEventType::FailureRecorded => "failure_recorded",
        CircuitEventType::SuccessRecorded => "success_recorded",
        CircuitEventType::ThresholdReached => "threshold_reached",
        CircuitEventType::RecoveryStarted => "recovery_started",
        CircuitEventType::RecoverySucceeded => "recovery_succeeded",
        CircuitEventType::RecoveryFailed => "recovery_failed",
        CircuitEventType::ExtensionApplied => "extension_applied",
        CircuitEventType::ManualReset => "manual_reset",
    }
}

fn parse_circuit_event_type(s: &str) -> Result<CircuitEventType, StoreError> {
    match s {
        "failure_recorded" => Ok(CircuitEventType::FailureRecorded),
        "success_recorded" => Ok(CircuitEventType::SuccessRecorded),
        "threshold_reached" => Ok(CircuitEventType::ThresholdReached),
        "recovery_started" => Ok(CircuitEventType::RecoveryStarted),
        "recovery_succeeded" => Ok(CircuitEventType::RecoverySucceeded),
        "recovery_failed" => Ok(CircuitEventType::RecoveryFailed),
        "extension_applied" => Ok(CircuitEventType::ExtensionApplied),
        "manual_reset" => Ok(CircuitEventType::ManualReset),
        other => Err(StoreError::Database(format!("unknown circuit event type: {other}"))),
    }
}

fn stage_str(s: Stage) -> &'static str {
    match s {
        Stage::Red => "red",
        Stage::Green => "green",
        Stage::Verify => "verify",
        Stage::Fix => "fix",
        Stage::Refactor => "refactor",
        Stage::ReVerify => "re_verify",
        Stage::Commit => "commit",
    }
}

fn parse_stage(s: &str) -> Result<Stage, StoreError> {
    match s {
        "red" => Ok(Stage::Red),
        "green" => Ok(Stage::Green),
        "verify" => Ok(Stage::Verify),
        "fix" => Ok(Stage::Fix),
        "refactor" => Ok(Stage::Refactor),
        "re_verify" => Ok(Stage::ReVerify),
        "commit" => Ok(Stage::Commit),
        other => Err(StoreError::Database(format!("unknown stage: {other}"))),
    }
}

fn run_status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(StoreError::Database(format!("unknown run status: {other}"))),
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task))]
    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_key, title, goal, phase, sequence, spec_id, test_file, impl_file,
                verify_command, done_criteria, acceptance_criteria, module_exports, depends_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(&task.task_key)
        .bind(&task.title)
        .bind(&task.goal)
        .bind(task.phase)
        .bind(task.sequence)
        .bind(task.spec_id)
        .bind(&task.test_file)
        .bind(&task.impl_file)
        .bind(&task.verify_command)
        .bind(&task.done_criteria)
        .bind(serde_json::to_value(&task.acceptance_criteria)?)
        .bind(serde_json::to_value(&task.module_exports)?)
        .bind(serde_json::to_value(&task.depends_on)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to insert task: {e}");
            StoreError::from(e)
        })?;
        Self::row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?;
        Self::row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn get_task_by_key(&self, task_key: &str) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_key = $1")
            .bind(task_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::TaskKeyNotFound(task_key.to_string()))?;
        Self::row_to_task(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list_tasks(&self, filter: TaskFilter) -> Result<(Vec<Task>, i64), StoreError> {
        let status = filter.status.map(task_status_str);
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::int IS NULL OR phase = $2)
            ORDER BY phase, sequence
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status)
        .bind(filter.phase)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query(
            r#"
            SELECT count(*) AS count FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::int IS NULL OR phase = $2)
            "#,
        )
        .bind(status)
        .bind(filter.phase)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        let tasks = rows.iter().map(Self::row_to_task).collect::<Result<Vec<_>, _>>()?;
        Ok((tasks, total))
    }

    #[instrument(skip(self))]
    async fn task_stats(&self) -> Result<TaskStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE status = 'pending') AS pending,
                count(*) FILTER (WHERE status = 'in_progress') AS running,
                count(*) FILTER (WHERE status IN ('passing', 'complete')) AS passed,
                count(*) FILTER (WHERE status IN ('blocked', 'blocked_static_review')) AS failed,
                count(*) AS total
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TaskStats {
            pending: row.get("pending"),
            running: row.get("running"),
            passed: row.get("passed"),
            failed: row.get("failed"),
            total: row.get("total"),
        })
    }

    #[instrument(skip(self))]
    async fn task_status_snapshot(&self) -> Result<HashMap<String, TaskStatus>, StoreError> {
        let rows = sqlx::query("SELECT task_key, status FROM tasks")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let key: String = r.get("task_key");
                let status: String = r.get("status");
                Ok((key, parse_task_status(&status)?))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn phase_progress(&self) -> Result<HashMap<i32, f64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT phase,
                   count(*) AS total,
                   count(*) FILTER (WHERE status = 'passing') AS passing
            FROM tasks
            GROUP BY phase
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let phase: i32 = r.get("phase");
                let total: i64 = r.get("total");
                let passing: i64 = r.get("passing");
                let pct = if total == 0 { 0.0 } else { (passing as f64 / total as f64) * 100.0 };
                (phase, pct)
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = $1, version = version + 1 WHERE id = $2")
            .bind(task_status_str(status))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn next_ready_task(&self) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM v_claimable_tasks ORDER BY phase, sequence LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn claim_task(
        &self,
        task_id: i64,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError> {
        // SKIP LOCKED avoids blocking on a row another worker is concurrently
        // evaluating; NOT FOR UPDATE of any row we don't end up claiming.
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM tasks
                WHERE id = $1
                  AND (status = 'pending' OR (status = 'in_progress' AND claim_expires_at < now()))
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET status = 'in_progress',
                claimed_by = $2,
                claimed_at = now(),
                claim_expires_at = now() + make_interval(secs => $3),
                version = version + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim task {task_id}: {e}");
            StoreError::from(e)
        })?;

        let claimed = row.is_some();
        if claimed {
            sqlx::query(
                "INSERT INTO task_claims (task_id, worker_id, claimed_at) VALUES ($1, $2, now())",
            )
            .bind(task_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
            debug!(task_id, worker_id, "claimed task");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn release_task(
        &self,
        task_id: i64,
        worker_id: &str,
        outcome: ClaimOutcome,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL, version = version + 1
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        let outcome_str = match outcome {
            ClaimOutcome::Completed => "completed",
            ClaimOutcome::Failed => "failed",
            ClaimOutcome::Timeout => "timeout",
            ClaimOutcome::Released => "released",
        };
        sqlx::query(
            r#"
            UPDATE task_claims
            SET released_at = now(), outcome = $1
            WHERE id = (
                SELECT id FROM task_claims
                WHERE task_id = $2 AND worker_id = $3 AND released_at IS NULL
                ORDER BY claimed_at DESC LIMIT 1
            )
            "#,
        )
        .bind(outcome_str)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                claim_expires_at = NULL, version = version + 1
            WHERE status = 'in_progress' AND claim_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            warn!(count, "reclaimed stale task leases");
        }
        Ok(count)
    }

    #[instrument(skip(self, attempt))]
    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Attempt, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO attempts (task_id, stage, attempt_number, success, error_message, exit_code, output, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            RETURNING *
            "#,
        )
        .bind(attempt.task_id)
        .bind(stage_str(attempt.stage))
        .bind(attempt.attempt_number)
        .bind(attempt.success)
        .bind(&attempt.error_message)
        .bind(attempt.exit_code)
        .bind(&attempt.output)
        .fetch_one(&self.pool)
        .await?;

        let stage: String = row.get("stage");
        Ok(Attempt {
            id: row.get("id"),
            task_id: row.get("task_id"),
            stage: parse_stage(&stage)?,
            attempt_number: row.get("attempt_number"),
            success: row.get("success"),
            error_message: row.get("error_message"),
            exit_code: row.get("exit_code"),
            output: row.get("output"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    #[instrument(skip(self))]
    async fn list_attempts(&self, task_id: i64) -> Result<Vec<Attempt>, StoreError> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE task_id = $1 ORDER BY attempt_number")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let stage: String = row.get("stage");
                Ok(Attempt {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    stage: parse_stage(&stage)?,
                    attempt_number: row.get("attempt_number"),
                    success: row.get("success"),
                    error_message: row.get("error_message"),
                    exit_code: row.get("exit_code"),
                    output: row.get("output"),
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, status, last_heartbeat)
            VALUES ($1, 'idle', now())
            ON CONFLICT (id) DO UPDATE SET status = 'idle', last_heartbeat = now()
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        current_task_id: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat = now(),
                current_task_id = $2,
                status = CASE WHEN $2 IS NOT NULL THEN 'active' ELSE 'idle' END
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_task_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT INTO worker_heartbeats (worker_id, current_task_id) VALUES ($1, $2)")
            .bind(worker_id)
            .bind(current_task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workers").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(WorkerInfo {
                    id: row.get("id"),
                    status: match status.as_str() {
                        "active" => WorkerStatus::Active,
                        "idle" => WorkerStatus::Idle,
                        other => {
                            return Err(StoreError::Database(format!("unknown worker status: {other}")))
                        }
                    },
                    current_task_id: row.get("current_task_id"),
                    branch_name: row.get("branch_name"),
                    last_heartbeat: row.get("last_heartbeat"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn stale_workers(&self, stale_after: chrono::Duration) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE last_heartbeat IS NULL OR last_heartbeat < now() - make_interval(secs => $1)",
        )
        .bind(stale_after.num_seconds() as f64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(WorkerInfo {
                    id: row.get("id"),
                    status: match status.as_str() {
                        "active" => WorkerStatus::Active,
                        _ => WorkerStatus::Idle,
                    },
                    current_task_id: row.get("current_task_id"),
                    branch_name: row.get("branch_name"),
                    last_heartbeat: row.get("last_heartbeat"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
    ) -> Result<Option<CircuitBreakerRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM circuit_breakers WHERE level = $1 AND identifier = $2")
            .bind(circuit_level_str(level))
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_circuit).transpose()
    }

    #[instrument(skip(self))]
    async fn get_circuit_by_id(&self, id: i64) -> Result<CircuitBreakerRow, StoreError> {
        let row = sqlx::query("SELECT * FROM circuit_breakers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::CircuitNotFound(id))?;
        Self::row_to_circuit(&row)
    }

    #[instrument(skip(self, config_snapshot))]
    async fn create_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
        run_id: Option<Uuid>,
        config_snapshot: serde_json::Value,
    ) -> Result<CircuitBreakerRow, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO circuit_breakers (level, identifier, run_id, config_snapshot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (level, identifier) DO UPDATE SET level = circuit_breakers.level
            RETURNING *
            "#,
        )
        .bind(circuit_level_str(level))
        .bind(identifier)
        .bind(run_id)
        .bind(&config_snapshot)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_circuit(&row)
    }

    #[instrument(skip(self, fields))]
    async fn update_circuit(
        &self,
        id: i64,
        expected_version: i64,
        fields: CircuitUpdate,
    ) -> Result<bool, StoreError> {
        let current = self.get_circuit_by_id(id).await?;
        let next = CircuitBreakerRow {
            state: fields.state.unwrap_or(current.state),
            failure_count: fields.failure_count.unwrap_or(current.failure_count),
            success_count: fields.success_count.unwrap_or(current.success_count),
            half_open_requests: fields.half_open_requests.unwrap_or(current.half_open_requests),
            extensions_count: fields.extensions_count.unwrap_or(current.extensions_count),
            opened_at: fields.opened_at.unwrap_or(current.opened_at),
            last_failure_at: fields.last_failure_at.unwrap_or(current.last_failure_at),
            last_success_at: fields.last_success_at.unwrap_or(current.last_success_at),
            last_state_change_at: fields.last_state_change_at.unwrap_or(current.last_state_change_at),
            config_snapshot: fields.config_snapshot.unwrap_or(current.config_snapshot.clone()),
            ..current
        };

        let result = sqlx::query(
            r#"
            UPDATE circuit_breakers
            SET state = $1, failure_count = $2, success_count = $3, half_open_requests = $4,
                extensions_count = $5, opened_at = $6, last_failure_at = $7, last_success_at = $8,
                last_state_change_at = $9, config_snapshot = $10, version = version + 1
            WHERE id = $11 AND version = $12
            "#,
        )
        .bind(next.state.to_string())
        .bind(next.failure_count)
        .bind(next.success_count)
        .bind(next.half_open_requests)
        .bind(next.extensions_count)
        .bind(next.opened_at)
        .bind(next.last_failure_at)
        .bind(next.last_success_at)
        .bind(next.last_state_change_at)
        .bind(&next.config_snapshot)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_circuits(
        &self,
        level: Option<CircuitLevel>,
        state: Option<CircuitState>,
    ) -> Result<Vec<CircuitBreakerRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM circuit_breakers
            WHERE ($1::text IS NULL OR level = $1)
              AND ($2::text IS NULL OR state = $2)
            "#,
        )
        .bind(level.map(circuit_level_str))
        .bind(state.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_circuit).collect()
    }

    #[instrument(skip(self, event))]
    async fn record_circuit_event(&self, event: NewCircuitEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_events
                (circuit_id, run_id, event_type, from_state, to_state, error_context)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.circuit_id)
        .bind(event.run_id)
        .bind(circuit_event_type_str(event.event_type))
        .bind(event.from_state.map(|s| s.to_string()))
        .bind(event.to_state.map(|s| s.to_string()))
        .bind(&event.error_context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_circuit_events(&self, circuit_id: i64) -> Result<Vec<CircuitBreakerEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM circuit_breaker_events WHERE circuit_id = $1 ORDER BY timestamp",
        )
        .bind(circuit_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let event_type: String = row.get("event_type");
                let from_state: Option<String> = row.get("from_state");
                let to_state: Option<String> = row.get("to_state");
                Ok(CircuitBreakerEvent {
                    id: row.get("id"),
                    circuit_id: row.get("circuit_id"),
                    run_id: row.get("run_id"),
                    event_type: parse_circuit_event_type(&event_type)?,
                    from_state: from_state.map(|s| parse_circuit_state(&s)).transpose()?,
                    to_state: to_state.map(|s| parse_circuit_state(&s)).transpose()?,
                    error_context: row.get("error_context"),
                    timestamp: row.get("timestamp"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn start_execution_run(&self, max_workers: i32) -> Result<ExecutionRun, StoreError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            "INSERT INTO execution_runs (id, max_workers) VALUES ($1, $2) RETURNING *",
        )
        .bind(id)
        .bind(max_workers)
        .fetch_one(&self.pool)
        .await?;
        let status: String = row.get("status");
        Ok(ExecutionRun {
            id: row.get("id"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            status: parse_run_status(&status)?,
            max_workers: row.get("max_workers"),
            total_invocations: row.get("total_invocations"),
        })
    }

    #[instrument(skip(self))]
    async fn complete_execution_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE execution_runs SET status = $1, completed_at = now() WHERE id = $2",
        )
        .bind(run_status_str(status))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution_run(&self, run_id: Uuid) -> Result<ExecutionRun, StoreError> {
        let row = sqlx::query("SELECT * FROM execution_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let status: String = row.get("status");
        Ok(ExecutionRun {
            id: row.get("id"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            status: parse_run_status(&status)?,
            max_workers: row.get("max_workers"),
            total_invocations: row.get("total_invocations"),
        })
    }

    #[instrument(skip(self))]
    async fn current_execution_run(&self) -> Result<Option<ExecutionRun>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM execution_runs WHERE status = 'running' ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let status: String = row.get("status");
            Ok(ExecutionRun {
                id: row.get("id"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                status: parse_run_status(&status)?,
                max_workers: row.get("max_workers"),
                total_invocations: row.get("total_invocations"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_execution_runs(&self) -> Result<Vec<ExecutionRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM execution_runs ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(ExecutionRun {
                    id: row.get("id"),
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    status: parse_run_status(&status)?,
                    max_workers: row.get("max_workers"),
                    total_invocations: row.get("total_invocations"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn record_invocation(&self, run_id: Uuid, task_id: i64, stage: Stage) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO invocations (run_id, task_id, stage) VALUES ($1, $2, $3)")
            .bind(run_id)
            .bind(task_id)
            .bind(stage_str(stage))
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE execution_runs SET total_invocations = total_invocations + 1 WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn invocation_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT count(*) AS count FROM invocations WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    #[instrument(skip(self))]
    async fn get_config_int(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let raw: Option<String> = row.map(|r| r.get("value"));
        Ok(parse_and_clamp(key, raw.as_deref(), default))
    }

    #[instrument(skip(self))]
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = $2
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn log_stash_operation(
        &self,
        task_id: i64,
        operation: &str,
        detail: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO git_stash_log (task_id, operation, detail) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(operation)
            .bind(&detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn log_static_review_metric(&self, task_id: i64, metric: &str, value: f64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO static_review_metrics (task_id, metric, value) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(metric)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
