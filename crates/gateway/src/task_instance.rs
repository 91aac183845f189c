//! Per-task lifecycle.
//!
//! One actor per task id. Owns the task record, the retry counter, and the
//! single pending timer (timeout while live, cleanup once terminal).
//! Dispatch runs detached from the creating request: the synchronous path
//! observes completion by polling its own stored status.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use taskgate_common::ids::TaskId;
use taskgate_common::types::{
    SelectionCriteria, Task, TaskAttempt, TaskRequest, TaskStatus, TaskUpdate,
};
use taskgate_common::{GatewayError, Result};

use crate::runtime::Runtime;
use crate::storage::{StorageHandle, TaskRow};

struct TaskState {
    task: Option<Task>,
    retry_count: u32,
    /// Set once the current terminal transition has emitted its complete
    /// event; cleared when a retry rewinds the task to PENDING.
    completion_notified: bool,
}

enum TimerPurpose {
    Timeout,
    Cleanup,
}

/// The lifecycle actor for one task.
pub struct TaskInstance {
    id: TaskId,
    runtime: Arc<Runtime>,
    storage: StorageHandle,
    state: Mutex<TaskState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskInstance {
    pub fn new(id: TaskId, runtime: Arc<Runtime>, storage: StorageHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            runtime,
            storage,
            state: Mutex::new(TaskState {
                task: None,
                retry_count: 0,
                completion_notified: false,
            }),
            timer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Create the task and kick off assignment.
    ///
    /// Idempotent: a second call returns the stored task unchanged.
    /// Asynchronous requests return immediately (normally still PENDING);
    /// synchronous requests poll the stored status until terminal or until
    /// the synchronous wait bound elapses.
    pub async fn create_task(self: &Arc<Self>, request: TaskRequest) -> Result<Task> {
        let is_async = request.is_async;

        let task = {
            let mut state = self.state.lock().await;
            if let Some(ref existing) = state.task {
                return Ok(existing.clone());
            }

            let task = Task::new(self.id.clone(), request);
            state.task = Some(task.clone());
            state.retry_count = 0;
            self.persist_locked(&state).await?;
            task
        };

        metrics::counter!("task.created").increment(1);
        tracing::info!(task_id = %self.id, task_type = %task.request.task_type, "Task created");

        // Count the task from creation so every complete event has a paired
        // start, even when assignment never finds a server.
        let stats = self.runtime.stats_today().await;
        stats.record_task_start(self.id.clone(), None).await;

        self.arm_timer(self.runtime.config().task.timeout_ms, TimerPurpose::Timeout)
            .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.assign_and_execute().await {
                this.fail_assignment(e).await;
            }
        });

        if is_async {
            Ok(task)
        } else {
            self.wait_for_terminal().await
        }
    }

    /// Snapshot of the stored task.
    pub async fn get_status(&self) -> Result<Task> {
        let state = self.state.lock().await;
        state
            .task
            .clone()
            .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", self.id)))
    }

    pub async fn retry_count(&self) -> u32 {
        self.state.lock().await.retry_count
    }

    /// Apply an update to a PROCESSING task. Worker callbacks and the
    /// synchronous dispatch path both land here.
    pub async fn update_task(self: &Arc<Self>, update: TaskUpdate) -> Result<Task> {
        let task = {
            let mut state = self.state.lock().await;
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", self.id)))?;

            if task.status != TaskStatus::Processing {
                return Err(GatewayError::IllegalTransition(format!(
                    "cannot update task in state {}",
                    task.status.as_str()
                )));
            }

            if let Some(progress) = update.progress {
                task.progress = progress.min(100);
            }
            if let Some(result) = update.result {
                task.result = Some(result);
            }
            if let Some(error) = update.error {
                task.error = Some(error);
            }
            task.status = update.status;
            task.updated_at = Utc::now();

            let task = task.clone();
            self.persist_locked(&state).await?;
            task
        };

        tracing::info!(task_id = %self.id, status = task.status.as_str(), "Task updated");
        self.upsert_table(&task).await;

        if task.status.is_terminal() {
            self.notify_completion(task.status == TaskStatus::Completed)
                .await;
            self.arm_timer(
                self.runtime.config().task.cleanup_delay_ms,
                TimerPurpose::Cleanup,
            )
            .await;
        }

        Ok(task)
    }

    /// Rewind a FAILED or TIMEOUT task to PENDING and re-dispatch.
    /// Returns false when no retry budget or state allows it, or when the
    /// new assignment immediately fails.
    pub async fn retry(self: &Arc<Self>) -> bool {
        let max_retries = self.runtime.config().task.max_retries;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let retry_count = state.retry_count;
            let Some(task) = state.task.as_mut() else {
                return false;
            };
            if retry_count >= max_retries {
                return false;
            }
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout) {
                return false;
            }

            task.attempts.push(TaskAttempt {
                attempt: retry_count + 1,
                started_at: Utc::now(),
                previous_status: task.status,
                previous_error: task.error.take(),
            });
            task.status = TaskStatus::Pending;
            task.updated_at = Utc::now();
            state.retry_count += 1;
            // The rewound task will reach a fresh terminal transition, which
            // must emit its own complete event.
            state.completion_notified = false;

            if let Err(e) = self.persist_locked(state).await {
                tracing::warn!(task_id = %self.id, error = %e, "Failed to persist retry state");
            }
        }

        metrics::counter!("task.retries").increment(1);
        tracing::info!(task_id = %self.id, "Task retrying");

        // Each attempt gets a fresh timeout window.
        self.arm_timer(self.runtime.config().task.timeout_ms, TimerPurpose::Timeout)
            .await;

        match self.assign_and_execute().await {
            Ok(()) => true,
            Err(e) => {
                self.fail_assignment(e).await;
                false
            }
        }
    }

    /// Cancel a non-terminal task. Explicitly non-idempotent: cancelling a
    /// terminal (including already-cancelled) task is an illegal transition.
    pub async fn cancel(self: &Arc<Self>) -> Result<Task> {
        let task = {
            let mut state = self.state.lock().await;
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", self.id)))?;

            if task.status.is_terminal() {
                return Err(GatewayError::IllegalTransition(format!(
                    "cannot cancel task in terminal state {}",
                    task.status.as_str()
                )));
            }

            task.status = TaskStatus::Cancelled;
            task.updated_at = Utc::now();
            let task = task.clone();
            self.persist_locked(&state).await?;
            task
        };

        tracing::info!(task_id = %self.id, "Task cancelled");
        metrics::counter!("task.cancelled").increment(1);

        self.upsert_table(&task).await;
        self.notify_completion(false).await;
        self.arm_timer(
            self.runtime.config().task.cleanup_delay_ms,
            TimerPurpose::Cleanup,
        )
        .await;

        Ok(task)
    }

    /// Pick a server and hand the task to it. The dispatch itself runs
    /// detached so this actor is free for callbacks and cancellation.
    fn assign_and_execute(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.assign_and_execute_inner())
    }

    async fn assign_and_execute_inner(self: &Arc<Self>) -> Result<()> {
        let (criteria, request) = {
            let state = self.state.lock().await;
            let task = state
                .task
                .as_ref()
                .ok_or_else(|| GatewayError::Internal("assignment without a task".into()))?;
            if task.status != TaskStatus::Pending {
                // Superseded while we were queued (e.g. cancelled).
                return Ok(());
            }
            (SelectionCriteria::from(&task.request), task.request.clone())
        };

        let server_id = self
            .runtime
            .balancer()
            .select_server(&criteria)
            .await
            .ok_or(GatewayError::NoAvailableServers)?;

        let task = {
            let mut state = self.state.lock().await;
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| GatewayError::Internal("assignment without a task".into()))?;
            if task.status != TaskStatus::Pending {
                // Cancelled while selection was in flight; release the slot.
                tracing::info!(task_id = %self.id, "Assignment superseded, not dispatching");
                return Ok(());
            }

            task.server_id = Some(server_id.clone());
            task.status = TaskStatus::Processing;
            task.updated_at = Utc::now();
            let task = task.clone();
            self.persist_locked(&state).await?;
            task
        };

        tracing::info!(task_id = %self.id, server_id = %server_id, "Task assigned");
        self.upsert_table(&task).await;

        let instance = self
            .runtime
            .existing_server_instance(&server_id)
            .await
            .ok_or_else(|| GatewayError::ServerUnavailable(server_id.clone()))?;

        let callback_url = format!(
            "{}/api/task/{}",
            self.runtime.config().worker_url.trim_end_matches('/'),
            self.id
        );

        let this = Arc::clone(self);
        let task_id = self.id.clone();
        let is_async = request.is_async;
        tokio::spawn(async move {
            if let Err(e) = instance.execute_task(task_id.clone(), request, callback_url).await {
                tracing::warn!(task_id = %task_id, error = %e, "Dispatch failed");
                if !is_async {
                    let update = TaskUpdate {
                        status: TaskStatus::Failed,
                        result: None,
                        progress: None,
                        error: Some(e.to_string()),
                    };
                    if let Err(e) = this.update_task(update).await {
                        tracing::debug!(task_id = %task_id, error = %e, "Failure update rejected");
                    }
                }
                // Asynchronous dispatch failures leave the task PROCESSING;
                // the callback or the timeout timer resolves it.
            }
        });

        Ok(())
    }

    /// Record an assignment failure as a terminal FAILED state.
    async fn fail_assignment(self: &Arc<Self>, error: GatewayError) {
        let message = match error {
            GatewayError::NoAvailableServers => "No available servers".to_string(),
            other => other.to_string(),
        };

        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.task.as_mut() else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }

            task.status = TaskStatus::Failed;
            task.error = Some(message.clone());
            task.updated_at = Utc::now();
            let task = task.clone();

            if let Err(e) = self.persist_locked(&state).await {
                tracing::warn!(task_id = %self.id, error = %e, "Failed to persist failure state");
            }
            task
        };

        tracing::warn!(task_id = %self.id, error = %message, "Task failed at assignment");
        metrics::counter!("task.assignment_failures").increment(1);

        self.upsert_table(&task).await;
        self.notify_completion(false).await;
        self.arm_timer(
            self.runtime.config().task.cleanup_delay_ms,
            TimerPurpose::Cleanup,
        )
        .await;
    }

    /// Synchronous createTask path: poll our own stored status.
    async fn wait_for_terminal(self: &Arc<Self>) -> Result<Task> {
        let task_config = &self.runtime.config().task;
        let deadline =
            std::time::Instant::now() + Duration::from_millis(task_config.sync_wait_ms);
        let poll = Duration::from_millis(task_config.sync_poll_interval_ms);

        loop {
            {
                let state = self.state.lock().await;
                if let Some(ref task) = state.task {
                    if task.status.is_terminal() {
                        return Ok(task.clone());
                    }
                }
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        // Wait bound elapsed: the caller gets TIMEOUT.
        let task = {
            let mut state = self.state.lock().await;
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| GatewayError::Internal("sync wait without a task".into()))?;
            if task.status.is_terminal() {
                return Ok(task.clone());
            }

            task.status = TaskStatus::Timeout;
            task.error = Some("Synchronous wait elapsed".into());
            task.updated_at = Utc::now();
            let task = task.clone();
            self.persist_locked(&state).await?;
            task
        };

        tracing::warn!(task_id = %self.id, "Synchronous wait timed out");
        self.upsert_table(&task).await;
        self.notify_completion(false).await;
        self.arm_timer(
            self.runtime.config().task.cleanup_delay_ms,
            TimerPurpose::Cleanup,
        )
        .await;

        Ok(task)
    }

    /// Emit the single complete event for a terminal transition.
    ///
    /// Idempotent per transition: converging paths (timeout timer plus a
    /// failed retry, for instance) may both land here, but only the first
    /// call emits. Rewinding to PENDING re-arms the guard.
    async fn notify_completion(&self, success: bool) {
        let (server_id, retries, duration_ms) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.completion_notified {
                return;
            }
            let Some(task) = state.task.as_ref() else {
                return;
            };

            let data = (
                task.server_id.clone(),
                state.retry_count,
                (task.updated_at - task.created_at).num_milliseconds().max(0) as u64,
            );
            state.completion_notified = true;
            data
        };

        let stats = self.runtime.stats_today().await;
        stats
            .record_task_complete(self.id.clone(), server_id, success, duration_ms, retries)
            .await;

        metrics::counter!("task.completed", "success" => success.to_string()).increment(1);
    }

    /// Arm the actor's single timer; any prior pending timer is superseded.
    ///
    /// The slot holds only the sleeping task. The handler runs in its own
    /// task, so a handler that arms the next timer (timeout → retry) never
    /// aborts itself.
    fn arm_timer(
        self: &Arc<Self>,
        delay_ms: u64,
        purpose: TimerPurpose,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.arm_timer_inner(delay_ms, purpose))
    }

    async fn arm_timer_inner(self: &Arc<Self>, delay_ms: u64, purpose: TimerPurpose) {
        let mut slot = self.timer.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }

        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            tokio::spawn(async move {
                match purpose {
                    TimerPurpose::Timeout => this.handle_timeout().await,
                    TimerPurpose::Cleanup => this.handle_cleanup().await,
                }
            });
        }));
    }

    /// Timeout timer fired: a task still PROCESSING transitions to TIMEOUT,
    /// then a retry is attempted; if none is possible the terminal state
    /// is notified and cleanup armed.
    async fn handle_timeout(self: &Arc<Self>) {
        let timed_out = {
            let mut state = self.state.lock().await;
            let timed = match state.task.as_mut() {
                Some(task) if task.status == TaskStatus::Processing => {
                    task.status = TaskStatus::Timeout;
                    task.error = Some("Task processing timed out".into());
                    task.updated_at = Utc::now();
                    Some(task.clone())
                }
                _ => None,
            };
            if timed.is_some() {
                if let Err(e) = self.persist_locked(&state).await {
                    tracing::warn!(task_id = %self.id, error = %e, "Failed to persist timeout");
                }
            }
            timed
        };

        let Some(task) = timed_out else {
            return;
        };

        tracing::warn!(task_id = %self.id, "Task timed out");
        metrics::counter!("task.timeouts").increment(1);
        self.upsert_table(&task).await;

        if !self.retry().await {
            self.notify_completion(false).await;
            self.arm_timer(
                self.runtime.config().task.cleanup_delay_ms,
                TimerPurpose::Cleanup,
            )
            .await;
        }
    }

    /// Cleanup timer fired: purge storage once the grace window has passed.
    async fn handle_cleanup(self: &Arc<Self>) {
        let cleanup_delay = self.runtime.config().task.cleanup_delay_ms as i64;

        {
            let state = self.state.lock().await;
            let Some(ref task) = state.task else {
                return;
            };
            if !task.status.is_terminal() {
                return;
            }
            let since_update = (Utc::now() - task.updated_at).num_milliseconds();
            // A later transition re-armed the window; leave the record alone.
            if since_update + 50 < cleanup_delay {
                return;
            }
        }

        if let Err(e) = self.storage.clear().await {
            tracing::warn!(task_id = %self.id, error = %e, "Failed to purge task storage");
        }
        self.runtime.remove_task_instance(&self.id).await;
        tracing::debug!(task_id = %self.id, "Task purged after retention window");
    }

    async fn persist_locked(&self, state: &TaskState) -> Result<()> {
        let created_at = state
            .task
            .as_ref()
            .map(|task| task.created_at.timestamp_millis())
            .unwrap_or_default();

        self.storage
            .put_many(vec![
                ("task".into(), serde_json::to_value(&state.task)?),
                ("retryCount".into(), serde_json::to_value(state.retry_count)?),
                ("createdAt".into(), serde_json::to_value(created_at)?),
            ])
            .await
    }

    /// Mirror the task into the external table. Write-only, best-effort.
    async fn upsert_table(&self, task: &Task) {
        let row = TaskRow {
            id: task.id.clone(),
            status: task.status,
            request: serde_json::to_value(&task.request).unwrap_or_default(),
            server_id: task.server_id.clone(),
            result: task.result.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        };

        if let Err(e) = self.runtime.task_table().upsert(row).await {
            tracing::warn!(task_id = %self.id, error = %e, "Task table upsert failed");
        }
    }
}
