//! Per-worker runtime state and dispatch.
//!
//! One actor per registered server id. Owns the adaptive health-check loop,
//! enforces the concurrency ceiling on dispatch, and pushes metrics snapshots
//! to the load balancer as fire-and-forget notifications.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use taskgate_common::ids::{ServerId, TaskId};
use taskgate_common::types::{ServerConfig, ServerMetrics, ServerStatus, TaskRequest, TaskStatus, TaskUpdate};
use taskgate_common::{GatewayError, Result};

use crate::runtime::Runtime;
use crate::storage::StorageHandle;

/// Health score applied to a freshly initialized server.
const INITIAL_HEALTH_SCORE: u8 = 100;
/// Score delta per successful / failed check.
const SCORE_GAIN: u8 = 5;
const SCORE_LOSS: u8 = 10;
/// Consecutive failures that take a server offline.
const OFFLINE_FAILURE_THRESHOLD: u32 = 3;
/// Consecutive successes that bring a degraded server back online.
const RECOVERY_SUCCESS_THRESHOLD: u32 = 3;

struct InstanceState {
    config: Option<ServerConfig>,
    status: ServerStatus,
    health_score: u8,
    consecutive_failures: u32,
    consecutive_successes: u32,
    check_interval_ms: u64,
    last_activity: DateTime<Utc>,
    active_tasks: HashSet<TaskId>,
    tasks_processed: u64,
    tasks_succeeded: u64,
    tasks_failed: u64,
    total_duration_ms: u64,
}

impl InstanceState {
    fn snapshot(&self) -> ServerMetrics {
        let (capabilities, max_concurrent) = self
            .config
            .as_ref()
            .map(|c| (c.capabilities.clone(), c.max_concurrent))
            .unwrap_or_default();

        ServerMetrics {
            tasks_processed: self.tasks_processed,
            tasks_succeeded: self.tasks_succeeded,
            tasks_failed: self.tasks_failed,
            success_rate: if self.tasks_processed > 0 {
                self.tasks_succeeded as f64 / self.tasks_processed as f64
            } else {
                1.0
            },
            average_response_time_ms: if self.tasks_processed > 0 {
                self.total_duration_ms as f64 / self.tasks_processed as f64
            } else {
                0.0
            },
            health_score: self.health_score,
            active_tasks: self.active_tasks.len() as u32,
            status: self.status,
            healthy: self.status == ServerStatus::Online,
            capabilities,
            max_concurrent,
            task_completed: false,
        }
    }
}

/// Runtime actor for one backend worker.
pub struct ServerInstance {
    id: ServerId,
    runtime: Arc<Runtime>,
    storage: StorageHandle,
    state: Mutex<InstanceState>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    pub fn new(id: ServerId, runtime: Arc<Runtime>, storage: StorageHandle) -> Arc<Self> {
        let initial_interval = runtime.config().health.initial_check_interval_ms;
        Arc::new(Self {
            id,
            runtime,
            storage,
            state: Mutex::new(InstanceState {
                config: None,
                status: ServerStatus::Initializing,
                health_score: INITIAL_HEALTH_SCORE,
                consecutive_failures: 0,
                consecutive_successes: 0,
                check_interval_ms: initial_interval,
                last_activity: Utc::now(),
                active_tasks: HashSet::new(),
                tasks_processed: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                total_duration_ms: 0,
            }),
            health_loop: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Store the registration config, come online, and start the health loop.
    /// Re-registration with the same id resets the runtime state.
    pub async fn initialize(self: &Arc<Self>, config: ServerConfig) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.config = Some(config);
            state.status = ServerStatus::Online;
            state.health_score = INITIAL_HEALTH_SCORE;
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            state.check_interval_ms = self.runtime.config().health.initial_check_interval_ms;
            state.last_activity = Utc::now();
            state.active_tasks.clear();
            state.tasks_processed = 0;
            state.tasks_succeeded = 0;
            state.tasks_failed = 0;
            state.total_duration_ms = 0;

            self.persist_state(&state).await?;
            state.snapshot()
        };

        self.start_health_loop().await;
        self.notify_balancer(snapshot);

        tracing::info!(server_id = %self.id, "Server instance initialized");
        Ok(())
    }

    /// Dispatch one task to the backend worker.
    ///
    /// Synchronous requests deliver their result back through the owning
    /// TaskInstance before this returns; asynchronous requests return as soon
    /// as the worker accepts the dispatch and complete later via callback.
    pub async fn execute_task(
        &self,
        task_id: TaskId,
        request: TaskRequest,
        callback_url: String,
    ) -> Result<()> {
        let config = {
            let mut state = self.state.lock().await;
            let config = state
                .config
                .clone()
                .ok_or_else(|| GatewayError::ServerUnavailable(self.id.clone()))?;

            if state.status != ServerStatus::Online {
                return Err(GatewayError::ServerUnavailable(self.id.clone()));
            }
            if state.active_tasks.len() as u32 >= config.max_concurrent {
                return Err(GatewayError::AtCapacity(self.id.clone()));
            }

            state.active_tasks.insert(task_id.clone());
            state.last_activity = Utc::now();
            config
        };

        let started = std::time::Instant::now();
        let body = serde_json::json!({
            "task_id": task_id,
            "request": request,
            "callback_url": callback_url,
        });

        let mut outbound = self
            .runtime
            .http()
            .post(&config.endpoints.predict)
            .timeout(Duration::from_millis(
                self.runtime.config().http.predict_timeout_ms,
            ))
            .json(&body);
        if let Some(ref key) = config.api_key {
            outbound = outbound.bearer_auth(key);
        }

        let response = outbound.send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) if resp.status().is_success() => {
                if !request.is_async {
                    match resp.json::<serde_json::Value>().await {
                        Ok(result) => self.deliver_sync_result(&task_id, result).await,
                        Err(e) => {
                            self.finish_dispatch(&task_id, false, duration_ms).await;
                            return Err(GatewayError::Backend(format!(
                                "invalid JSON from {}: {}",
                                config.endpoints.predict, e
                            )));
                        }
                    }
                }
                self.finish_dispatch(&task_id, true, duration_ms).await;
                Ok(())
            }
            Ok(resp) => {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                self.finish_dispatch(&task_id, false, duration_ms).await;
                Err(GatewayError::Backend(format!(
                    "predict returned {}: {}",
                    status, detail
                )))
            }
            Err(e) => {
                self.finish_dispatch(&task_id, false, duration_ms).await;
                Err(GatewayError::Backend(e.to_string()))
            }
        }
    }

    /// Apply a synchronous predict response to the owning task. A task that
    /// was cancelled mid-flight rejects the transition; that is not our error.
    async fn deliver_sync_result(&self, task_id: &TaskId, result: serde_json::Value) {
        let Some(task) = self.runtime.existing_task_instance(task_id).await else {
            tracing::warn!(task_id = %task_id, "Sync result for unknown task dropped");
            return;
        };

        let update = TaskUpdate {
            status: TaskStatus::Completed,
            result: Some(result),
            progress: Some(100),
            error: None,
        };
        if let Err(e) = task.update_task(update).await {
            tracing::warn!(task_id = %task_id, error = %e, "Sync completion rejected by task");
        }
    }

    /// Close the books on one dispatch: active set, activity clock, cumulative
    /// metrics, persistence, balancer notification.
    async fn finish_dispatch(&self, task_id: &TaskId, success: bool, duration_ms: u64) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.active_tasks.remove(task_id);
            state.last_activity = Utc::now();
            state.tasks_processed += 1;
            if success {
                state.tasks_succeeded += 1;
            } else {
                state.tasks_failed += 1;
            }
            state.total_duration_ms += duration_ms;

            if let Err(e) = self.persist_state(&state).await {
                tracing::warn!(server_id = %self.id, error = %e, "Failed to persist dispatch state");
            }

            let mut snapshot = state.snapshot();
            snapshot.task_completed = true;
            snapshot
        };

        metrics::counter!("server.dispatches", "success" => success.to_string()).increment(1);
        self.notify_balancer(snapshot);
    }

    /// Current metrics snapshot.
    pub async fn get_metrics(&self) -> ServerMetrics {
        self.state.lock().await.snapshot()
    }

    /// Flip between maintenance and online.
    pub async fn set_maintenance_mode(self: &Arc<Self>, enabled: bool) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.config.is_none() {
                return Err(GatewayError::NotFound(format!(
                    "server {} is not initialized",
                    self.id
                )));
            }

            state.status = if enabled {
                ServerStatus::Maintenance
            } else {
                ServerStatus::Online
            };
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            self.persist_state(&state).await?;
            state.snapshot()
        };

        tracing::info!(server_id = %self.id, enabled, "Maintenance mode changed");
        self.notify_registry_status(snapshot.status);

        if enabled {
            let balancer = self.runtime.balancer();
            let id = self.id.clone();
            tokio::spawn(async move { balancer.mark_server_unhealthy(&id).await });
        } else {
            self.notify_balancer(snapshot);
        }
        Ok(())
    }

    /// Go offline, wait for active dispatches to drain (bounded), then clear
    /// storage and drop out of the runtime map.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.status = ServerStatus::Offline;
            if let Err(e) = self.persist_state(&state).await {
                tracing::warn!(server_id = %self.id, error = %e, "Failed to persist shutdown state");
            }
        }

        if let Some(handle) = self.health_loop.lock().await.take() {
            handle.abort();
        }

        let http = self.runtime.config().http.clone();
        let deadline =
            std::time::Instant::now() + Duration::from_millis(http.shutdown_drain_ms);
        loop {
            let active = self.state.lock().await.active_tasks.len();
            if active == 0 {
                break;
            }
            if std::time::Instant::now() >= deadline {
                tracing::warn!(
                    server_id = %self.id,
                    active,
                    "Shutdown drain timed out, proceeding"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(http.shutdown_poll_ms)).await;
        }

        let balancer = self.runtime.balancer();
        let id = self.id.clone();
        tokio::spawn(async move { balancer.mark_server_unhealthy(&id).await });

        self.storage.clear().await?;
        self.runtime.remove_server_instance(&self.id).await;

        tracing::info!(server_id = %self.id, "Server instance shut down");
        Ok(())
    }

    /// (Re)start the health loop. The previous loop, if any, is superseded.
    async fn start_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_loop.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }

        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                let delay = this.state.lock().await.check_interval_ms;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if !this.health_tick().await {
                    break;
                }
            }
        }));
    }

    /// One firing of the health timer. Returns false to end the loop.
    async fn health_tick(self: &Arc<Self>) -> bool {
        let (config, status, idle_and_drained) = {
            let state = self.state.lock().await;
            let idle_ms = (Utc::now() - state.last_activity).num_milliseconds().max(0) as u64;
            (
                state.config.clone(),
                state.status,
                state.active_tasks.is_empty()
                    && idle_ms > self.runtime.config().health.max_idle_ms,
            )
        };

        let Some(config) = config else {
            return false;
        };

        if idle_and_drained {
            tracing::info!(server_id = %self.id, "Idle beyond limit, shutting down");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.shutdown().await {
                    tracing::error!(server_id = %this.id, error = %e, "Idle shutdown failed");
                }
            });
            return false;
        }

        // Maintenance pauses checking but keeps the timer alive.
        if status == ServerStatus::Maintenance {
            return true;
        }

        let healthy = self.probe_health(&config).await;
        let (snapshot, old_status) = {
            let mut state = self.state.lock().await;
            let old_status = state.status;
            apply_check_outcome(&mut state, &self.runtime.config().health, healthy);
            if let Err(e) = self.persist_state(&state).await {
                tracing::warn!(server_id = %self.id, error = %e, "Failed to persist health state");
            }
            (state.snapshot(), old_status)
        };

        metrics::counter!("server.health_checks", "healthy" => healthy.to_string()).increment(1);
        if snapshot.status != old_status {
            tracing::info!(
                server_id = %self.id,
                from = old_status.as_str(),
                to = snapshot.status.as_str(),
                "Server status transition"
            );
            self.notify_registry_status(snapshot.status);
        }

        if healthy {
            let registry = self.runtime.registry();
            let id = self.id.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.update_heartbeat(&id).await {
                    tracing::debug!(server_id = %id, error = %e, "Heartbeat rejected");
                }
            });
        }

        self.notify_balancer(snapshot);
        true
    }

    /// GET the worker's health endpoint. Healthy means 2xx AND the body
    /// identifies itself as the server we registered.
    async fn probe_health(&self, config: &ServerConfig) -> bool {
        let response = self
            .runtime
            .http()
            .get(&config.endpoints.health)
            .timeout(Duration::from_millis(
                self.runtime.config().http.health_timeout_ms,
            ))
            .send()
            .await;

        let resp = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!(server_id = %self.id, status = %resp.status(), "Health check non-2xx");
                return false;
            }
            Err(e) => {
                tracing::debug!(server_id = %self.id, error = %e, "Health check failed");
                return false;
            }
        };

        let body: serde_json::Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(server_id = %self.id, error = %e, "Health body unreadable");
                return false;
            }
        };

        let reported = body
            .get("serverId")
            .or_else(|| body.get("server_id"))
            .and_then(|v| v.as_str());

        match reported {
            Some(id) if id == self.id.as_str() => true,
            Some(other) => {
                // The peer answering is not the peer we registered.
                tracing::warn!(
                    server_id = %self.id,
                    reported = other,
                    "Health identity mismatch"
                );
                false
            }
            None => false,
        }
    }

    /// Persist the runtime state keys in one transaction.
    async fn persist_state(&self, state: &InstanceState) -> Result<()> {
        let metrics = serde_json::json!({
            "tasksProcessed": state.tasks_processed,
            "tasksSucceeded": state.tasks_succeeded,
            "tasksFailed": state.tasks_failed,
            "totalDurationMs": state.total_duration_ms,
        });

        self.storage
            .put_many(vec![
                ("config".into(), serde_json::to_value(&state.config)?),
                ("status".into(), serde_json::to_value(state.status)?),
                ("healthScore".into(), serde_json::to_value(state.health_score)?),
                (
                    "checkInterval".into(),
                    serde_json::to_value(state.check_interval_ms)?,
                ),
                (
                    "lastActivityTime".into(),
                    serde_json::to_value(state.last_activity.timestamp_millis())?,
                ),
                ("metrics".into(), metrics),
            ])
            .await
    }

    /// Fire-and-forget metrics push; the balancer must never be awaited from
    /// a path it can call back into.
    fn notify_balancer(&self, snapshot: ServerMetrics) {
        let balancer = self.runtime.balancer();
        let id = self.id.clone();
        tokio::spawn(async move {
            balancer.update_server_metrics(&id, snapshot).await;
        });
    }

    /// Keep the registry's fleet view in step with our status transitions.
    fn notify_registry_status(&self, status: ServerStatus) {
        let registry = self.runtime.registry();
        let id = self.id.clone();
        tokio::spawn(async move {
            registry.reflect_instance_status(&id, status).await;
        });
    }
}

/// Adaptive health bookkeeping: score, streaks, status, interval.
fn apply_check_outcome(
    state: &mut InstanceState,
    health: &taskgate_common::config::HealthConfig,
    healthy: bool,
) {
    if healthy {
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        state.health_score = state.health_score.saturating_add(SCORE_GAIN).min(100);

        if matches!(state.status, ServerStatus::Degraded | ServerStatus::Offline)
            && state.consecutive_successes >= RECOVERY_SUCCESS_THRESHOLD
        {
            state.status = ServerStatus::Online;
        }

        state.check_interval_ms =
            ((state.check_interval_ms as f64 * 1.2) as u64).min(health.max_check_interval_ms);
    } else {
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.health_score = state.health_score.saturating_sub(SCORE_LOSS);

        if state.consecutive_failures >= OFFLINE_FAILURE_THRESHOLD {
            state.status = ServerStatus::Offline;
        } else {
            state.status = ServerStatus::Degraded;
        }

        state.check_interval_ms =
            ((state.check_interval_ms as f64 / 1.5) as u64).max(health.min_check_interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_common::config::HealthConfig;

    fn state_for_test() -> InstanceState {
        InstanceState {
            config: None,
            status: ServerStatus::Online,
            health_score: INITIAL_HEALTH_SCORE,
            consecutive_failures: 0,
            consecutive_successes: 0,
            check_interval_ms: 10_000,
            last_activity: Utc::now(),
            active_tasks: HashSet::new(),
            tasks_processed: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_duration_ms: 0,
        }
    }

    fn apply(state: &mut InstanceState, health: &HealthConfig, healthy: bool) {
        apply_check_outcome(state, health, healthy);
    }

    #[test]
    fn three_failures_take_server_offline() {
        let health = HealthConfig::default();
        let mut state = state_for_test();

        apply(&mut state, &health, false);
        assert_eq!(state.status, ServerStatus::Degraded);
        apply(&mut state, &health, false);
        assert_eq!(state.status, ServerStatus::Degraded);
        apply(&mut state, &health, false);
        assert_eq!(state.status, ServerStatus::Offline);
        assert_eq!(state.health_score, 70);
    }

    #[test]
    fn three_successes_recover_a_degraded_server() {
        let health = HealthConfig::default();
        let mut state = state_for_test();

        apply(&mut state, &health, false);
        assert_eq!(state.status, ServerStatus::Degraded);

        apply(&mut state, &health, true);
        apply(&mut state, &health, true);
        assert_eq!(state.status, ServerStatus::Degraded);
        apply(&mut state, &health, true);
        assert_eq!(state.status, ServerStatus::Online);
    }

    #[test]
    fn health_score_saturates_at_bounds() {
        let health = HealthConfig::default();
        let mut state = state_for_test();

        for _ in 0..20 {
            apply(&mut state, &health, false);
        }
        assert_eq!(state.health_score, 0);
        assert_eq!(state.status, ServerStatus::Offline);

        for _ in 0..40 {
            apply(&mut state, &health, true);
        }
        assert_eq!(state.health_score, 100);
        assert_eq!(state.status, ServerStatus::Online);
    }

    #[test]
    fn check_interval_stays_within_bounds() {
        let health = HealthConfig::default();
        let mut state = state_for_test();

        for _ in 0..30 {
            apply(&mut state, &health, true);
        }
        assert_eq!(state.check_interval_ms, health.max_check_interval_ms);

        for _ in 0..30 {
            apply(&mut state, &health, false);
        }
        assert_eq!(state.check_interval_ms, health.min_check_interval_ms);
    }

    #[test]
    fn snapshot_rates_default_sanely_when_unused() {
        let state = state_for_test();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.average_response_time_ms, 0.0);
        assert!(snapshot.healthy);
    }
}
