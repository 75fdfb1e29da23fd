//! DB observer: polls the store for the full task-status snapshot, diffs it
//! against the previous tick, and dispatches one event per differing key to every
//! registered callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_store::TaskStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::ObserverConfig;
use crate::error::ObserverError;
use crate::event::StatusChangeEvent;

/// A registered consumer of status-change events. Errors are logged and never
/// abort the tick or block other callbacks.
#[async_trait]
pub trait StatusChangeCallback: Send + Sync + 'static {
    async fn on_change(&self, event: StatusChangeEvent) -> Result<(), CallbackError>;
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque token returned by [`DbObserver::register_callback`] for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

pub struct DbObserver {
    store: Arc<dyn TaskStore>,
    config: ObserverConfig,
    callbacks: Arc<Mutex<HashMap<u64, Arc<dyn StatusChangeCallback>>>>,
    next_handle: AtomicU64,
    snapshot: Arc<Mutex<HashMap<String, orchestrator_store::TaskStatus>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl DbObserver {
    pub fn new(store: Arc<dyn TaskStore>, config: ObserverConfig) -> Self {
        Self {
            store,
            config,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(0),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx: Mutex::new(None),
            join_handle: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub async fn register_callback(
        &self,
        callback: Arc<dyn StatusChangeCallback>,
    ) -> CallbackHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().await.insert(id, callback);
        CallbackHandle(id)
    }

    pub async fn unregister_callback(&self, handle: CallbackHandle) {
        self.callbacks.lock().await.remove(&handle.0);
    }

    /// Idempotent: a second call while already running is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ObserverError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(tx);

        let store = self.store.clone();
        let callbacks = self.callbacks.clone();
        let snapshot = self.snapshot.clone();
        let interval = self.config.poll_interval;
        let handle = tokio::spawn(run_loop(store, interval, callbacks, snapshot, rx));
        *self.join_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Idempotent: a second call while already stopped is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.join_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "observer task panicked during stop");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    store: Arc<dyn TaskStore>,
    interval: std::time::Duration,
    callbacks: Arc<Mutex<HashMap<u64, Arc<dyn StatusChangeCallback>>>>,
    snapshot: Arc<Mutex<HashMap<String, orchestrator_store::TaskStatus>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
        if let Err(e) = tick(&store, &callbacks, &snapshot).await {
            error!(error = %e, "observer tick failed");
        }
    }
}

async fn tick(
    store: &Arc<dyn TaskStore>,
    callbacks: &Arc<Mutex<HashMap<u64, Arc<dyn StatusChangeCallback>>>>,
    snapshot: &Arc<Mutex<HashMap<String, orchestrator_store::TaskStatus>>>,
) -> Result<(), ObserverError> {
    let current = store.task_status_snapshot().await?;

    let changes = {
        let prev = snapshot.lock().await;
        let mut changes = Vec::new();
        for (task_key, status) in &current {
            if let Some(old) = prev.get(task_key) {
                if old != status {
                    changes.push(StatusChangeEvent {
                        task_key: task_key.clone(),
                        old_status: *old,
                        new_status: *status,
                        timestamp: Utc::now(),
                    });
                }
            }
            // absent from `prev` => newly observed task; no event on first sighting.
        }
        changes
    };
    *snapshot.lock().await = current;

    if changes.is_empty() {
        return Ok(());
    }
    debug!(count = changes.len(), "dispatching status-change events");

    let subscribers: Vec<_> = callbacks.lock().await.values().cloned().collect();
    for event in changes {
        for callback in &subscribers {
            if let Err(e) = callback.on_change(event.clone()).await {
                error!(error = %e, task_key = %event.task_key, "observer callback failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::{InMemoryTaskStore, NewTask, TaskStatus};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingCallback {
        events: TokioMutex<Vec<StatusChangeEvent>>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl StatusChangeCallback for RecordingCallback {
        async fn on_change(&self, event: StatusChangeEvent) -> Result<(), CallbackError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("synthetic callback failure".into());
            }
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    async fn seed_task(store: &Arc<dyn TaskStore>, key: &str) -> orchestrator_store::Task {
        store
            .insert_task(NewTask {
                task_key: key.into(),
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
    async fn first_tick_establishes_baseline_without_events() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        seed_task(&store, "TDD-01").await;
        let observer = DbObserver::new(store.clone(), ObserverConfig::default());
        let cb = Arc::new(RecordingCallback {
            events: TokioMutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        });
        observer.register_callback(cb.clone()).await;

        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        assert!(cb.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn subsequent_tick_emits_diff_and_isolates_callback_errors() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = seed_task(&store, "TDD-02").await;
        let observer = DbObserver::new(store.clone(), ObserverConfig::default());
        let cb = Arc::new(RecordingCallback {
            events: TokioMutex::new(Vec::new()),
            fail_next: AtomicBool::new(true),
        });
        observer.register_callback(cb.clone()).await;

        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        store
            .update_task_status(task.id, TaskStatus::InProgress)
            .await
            .unwrap();
        // callback errors on this call but the tick must still complete cleanly.
        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        assert!(cb.events.lock().await.is_empty());

        store
            .update_task_status(task.id, TaskStatus::Passing)
            .await
            .unwrap();
        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        let events = cb.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_status, TaskStatus::InProgress);
        assert_eq!(events[0].new_status, TaskStatus::Passing);
    }

    #[tokio::test]
    async fn identical_successive_status_produces_no_event() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        seed_task(&store, "TDD-03").await;
        let observer = DbObserver::new(store.clone(), ObserverConfig::default());
        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        tick(&store, &observer.callbacks, &observer.snapshot)
            .await
            .unwrap();
        assert!(observer.snapshot.lock().await.len() == 1);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let observer = DbObserver::new(
            store,
            ObserverConfig::default().with_poll_interval(Duration::from_millis(5)),
        );
        observer.start().await.unwrap();
        observer.start().await.unwrap();
        assert!(observer.is_running());
        observer.stop().await;
        observer.stop().await;
        assert!(!observer.is_running());
    }

}
