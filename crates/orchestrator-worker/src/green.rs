//! The GREEN iterative-feedback loop: runs the GREEN stage up to
//! `max_attempts` times, threading the previous attempt's (truncated) output as
//! feedback, subject to an aggregate wall-clock budget.

use std::sync::Arc;
use std::time::Instant;

use orchestrator_store::{NewAttempt, Stage, Task, TaskStore};
use tracing::{debug, info, warn};

use crate::config::GreenRetryConfig;
use crate::error::WorkerError;
use crate::executor::{truncate_for_feedback, StageExecutor, StageRequest, StageResult};

/// Runs the GREEN stage to completion or exhaustion. Records one dense,
/// monotonically-numbered [`orchestrator_store::Attempt`] per loop iteration
/// actually executed — never more, never fewer.
pub async fn run_green_retry_loop(
    store: &Arc<dyn TaskStore>,
    executor: &Arc<dyn StageExecutor>,
    task: &Task,
    config: GreenRetryConfig,
) -> Result<StageResult, WorkerError> {
    let start = Instant::now();
    let mut last_result: Option<StageResult> = None;

    for attempt in 1..=config.max_attempts {
        if start.elapsed() >= config.max_retry_time {
            warn!(task_id = task.id, attempt, "GREEN budget exhausted before attempt ran");
            break;
        }

        let previous_failure = if attempt >= 2 {
            last_result
                .as_ref()
                .and_then(|r| r.output.as_deref().or(r.error.as_deref()))
                .map(truncate_for_feedback)
        } else {
            None
        };

        debug!(task_id = task.id, attempt, "invoking GREEN stage executor");
        let result = executor
            .execute(StageRequest {
                task: task.clone(),
                stage: Stage::Green,
                previous_failure,
            })
            .await;

        store
            .record_attempt(NewAttempt {
                task_id: task.id,
                stage: Stage::Green,
                attempt_number: attempt as i32,
                success: result.success,
                error_message: result.error.clone(),
                exit_code: result.exit_code,
                output: result.output.clone(),
            })
            .await?;

        if result.success {
            info!(task_id = task.id, attempt, "GREEN succeeded");
            return Ok(result);
        }

        let is_last_attempt = attempt == config.max_attempts;
        last_result = Some(result);
        if !is_last_attempt && start.elapsed() < config.max_retry_time {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    Ok(last_result.unwrap_or_else(|| {
        StageResult::failed("GREEN retry budget exhausted before any attempt ran")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchestrator_store::{InMemoryTaskStore, NewTask};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyExecutor {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageExecutor for FlakyExecutor {
        async fn execute(&self, request: StageRequest) -> StageResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                StageResult::failed(format!("attempt {n} failed, saw previous={:?}", request.previous_failure))
            } else {
                StageResult::ok("green passed")
            }
        }
    }

    async fn seed_task(store: &Arc<dyn TaskStore>) -> Task {
        store
            .insert_task(NewTask {
                task_key: "TDD-02".into(),
                title: "t".into(),
                goal: "g".into(),
                phase: 1,
                sequence: 1,
                spec_id: None,
                test_file: None,
                impl_file: None,
                verify_command: None,
                done_criteria: None,
                acceptance_criteria: vec![],
                module_exports: vec![],
                depends_on: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_threads_previous_output() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = seed_task(&store).await;
        let executor: Arc<dyn StageExecutor> = Arc::new(FlakyExecutor {
            fail_times: 1,
            calls: AtomicU32::new(0),
        });
        let config = GreenRetryConfig {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1),
            max_retry_time: Duration::from_secs(5),
        };
        let result = run_green_retry_loop(&store, &executor, &task, config)
            .await
            .unwrap();
        assert!(result.success);

        let attempts = store.list_attempts(task.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_number, 1);
        assert!(!attempts[0].success);
        assert_eq!(attempts[1].attempt_number, 2);
        assert!(attempts[1].success);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_on_persistent_failure() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = seed_task(&store).await;
        let executor: Arc<dyn StageExecutor> = Arc::new(FlakyExecutor {
            fail_times: 99,
            calls: AtomicU32::new(0),
        });
        let config = GreenRetryConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            max_retry_time: Duration::from_secs(5),
        };
        let result = run_green_retry_loop(&store, &executor, &task, config)
            .await
            .unwrap();
        assert!(!result.success);
        let attempts = store.list_attempts(task.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
    }

    #[tokio::test]
    async fn respects_aggregate_budget() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = seed_task(&store).await;
        let executor: Arc<dyn StageExecutor> = Arc::new(FlakyExecutor {
            fail_times: 99,
            calls: AtomicU32::new(0),
        });
        let config = GreenRetryConfig {
            max_attempts: 10,
            retry_delay: Duration::from_millis(50),
            max_retry_time: Duration::from_millis(120),
        };
        let start = Instant::now();
        let result = run_green_retry_loop(&store, &executor, &task, config)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
