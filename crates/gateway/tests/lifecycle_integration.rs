//! End-to-end lifecycle tests against the real actor stack.
//!
//! Backend workers are stubbed with local axum servers bound to ephemeral
//! ports; everything else (registry, balancer, instances, tasks, stats) is
//! the production code path backed by in-memory storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use taskgate_common::api::servers::RegisterServerRequest;
use taskgate_common::config::GatewayConfig;
use taskgate_common::ids::ServerId;
use taskgate_common::types::{
    ServerEndpoints, ServerFilter, ServerStatus, TaskRequest, TaskStatus, TaskUpdate,
};
use taskgate_gateway::runtime::Runtime;
use taskgate_gateway::storage::{MemoryStorage, MemoryTaskTable};

#[derive(Clone, Copy)]
enum PredictMode {
    /// 200 with a JSON result (synchronous worker).
    Sync,
    /// 202 accepted; the result arrives later via callback.
    Accept,
    /// 202 accepted after holding the request open for a while.
    SlowAccept,
}

#[derive(Clone, Copy)]
enum HealthMode {
    Ok,
    Error,
}

struct WorkerState {
    server_id: String,
    predict: PredictMode,
    health: HealthMode,
    predict_calls: AtomicUsize,
}

async fn predict_handler(
    State(state): State<Arc<WorkerState>>,
    Json(_body): Json<Value>,
) -> impl IntoResponse {
    state.predict_calls.fetch_add(1, Ordering::SeqCst);
    match state.predict {
        PredictMode::Sync => (StatusCode::OK, Json(json!({"output_url": "x"}))),
        PredictMode::Accept => (StatusCode::ACCEPTED, Json(json!({"status": "PROCESSING"}))),
        PredictMode::SlowAccept => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            (StatusCode::ACCEPTED, Json(json!({"status": "PROCESSING"})))
        }
    }
}

async fn health_handler(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    match state.health {
        HealthMode::Ok => (
            StatusCode::OK,
            Json(json!({"serverId": state.server_id})),
        ),
        HealthMode::Error => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "unhealthy"})),
        ),
    }
}

struct StubWorker {
    base_url: String,
    state: Arc<WorkerState>,
}

impl StubWorker {
    fn predict_calls(&self) -> usize {
        self.state.predict_calls.load(Ordering::SeqCst)
    }
}

async fn spawn_worker(server_id: &str, predict: PredictMode, health: HealthMode) -> StubWorker {
    let state = Arc::new(WorkerState {
        server_id: server_id.to_string(),
        predict,
        health,
        predict_calls: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/predict", post(predict_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubWorker {
        base_url: format!("http://{}", addr),
        state,
    }
}

fn test_runtime(tune: impl FnOnce(&mut GatewayConfig)) -> Arc<Runtime> {
    let mut config = GatewayConfig::default();
    config.worker_url = "http://gateway.test".into();
    config.jwt_secret = "secret".into();
    config.task.sync_wait_ms = 2_000;
    config.task.sync_poll_interval_ms = 10;
    tune(&mut config);

    Runtime::new(
        Arc::new(config),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryTaskTable::new()),
        reqwest::Client::new(),
    )
}

fn registration(id: &str, worker: &StubWorker, capabilities: &[&str]) -> RegisterServerRequest {
    RegisterServerRequest {
        id: Some(id.into()),
        name: format!("worker-{}", id),
        endpoints: ServerEndpoints {
            predict: format!("{}/predict", worker.base_url),
            health: format!("{}/health", worker.base_url),
            metrics: None,
        },
        api_key: None,
        max_concurrent: 2,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        groups: vec![],
        priority: 1,
    }
}

fn video_request(is_async: bool) -> TaskRequest {
    TaskRequest {
        task_type: "video-processing".into(),
        priority: 1,
        payload: json!({"input_url": "u"}),
        required_capabilities: vec!["video".into()],
        is_async,
    }
}

async fn await_status(
    runtime: &Arc<Runtime>,
    task_id: &taskgate_common::ids::TaskId,
    status: TaskStatus,
) -> taskgate_common::types::Task {
    for _ in 0..300 {
        if let Some(instance) = runtime.existing_task_instance(task_id).await {
            if let Ok(task) = instance.get_status().await {
                if task.status == status {
                    return task;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {:?}", task_id, status);
}

#[tokio::test]
async fn happy_async_path_with_callback() {
    let runtime = test_runtime(|_| {});
    let worker = spawn_worker("S1", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S1", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T1");
    let instance = runtime.task_instance(&task_id).await;
    let created = instance.create_task(video_request(true)).await.unwrap();
    assert_eq!(created.status, TaskStatus::Pending);

    let processing = await_status(&runtime, &task_id, TaskStatus::Processing).await;
    assert_eq!(processing.server_id, Some(ServerId::from("S1")));

    // The worker delivers its result through the callback path.
    let update = TaskUpdate {
        status: TaskStatus::Completed,
        result: Some(json!({"output_url": "x"})),
        progress: Some(100),
        error: None,
    };
    instance.update_task(update).await.unwrap();

    let done = instance.get_status().await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"output_url": "x"})));

    // The dispatch POST runs detached; give it a moment to land.
    for _ in 0..100 {
        if worker.predict_calls() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(worker.predict_calls() >= 1);
}

#[tokio::test]
async fn sync_path_returns_worker_result() {
    let runtime = test_runtime(|_| {});
    let worker = spawn_worker("S1", PredictMode::Sync, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S1", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T1");
    let instance = runtime.task_instance(&task_id).await;
    let task = instance.create_task(video_request(false)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"output_url": "x"})));
    assert_eq!(task.progress, 100);
}

#[tokio::test]
async fn no_available_servers_fails_task() {
    let runtime = test_runtime(|_| {});

    let task_id = taskgate_common::ids::TaskId::from("T1");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();

    let failed = await_status(&runtime, &task_id, TaskStatus::Failed).await;
    assert!(failed.error.unwrap().contains("No available servers"));

    // The task is counted from creation, so the failure has a paired start.
    let stats = runtime.stats_today().await.get_stats().await;
    assert_eq!(stats.counters.total_tasks, 1);
    assert_eq!(stats.counters.failed_tasks, 1);
    assert_eq!(stats.counters.pending_tasks, 0);
}

#[tokio::test]
async fn capability_filtering_routes_to_the_capable_server() {
    let runtime = test_runtime(|_| {});
    let image_worker = spawn_worker("A", PredictMode::Accept, HealthMode::Ok).await;
    let video_worker = spawn_worker("B", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("A", &image_worker, &["image"]))
        .await
        .unwrap();
    runtime
        .registry()
        .register_server(registration("B", &video_worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T1");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();

    let processing = await_status(&runtime, &task_id, TaskStatus::Processing).await;
    assert_eq!(processing.server_id, Some(ServerId::from("B")));
    assert_eq!(image_worker.predict_calls(), 0);
}

#[tokio::test]
async fn health_failures_take_the_server_out_of_rotation() {
    let runtime = test_runtime(|config| {
        config.health.min_check_interval_ms = 10;
        config.health.initial_check_interval_ms = 20;
        config.health.max_check_interval_ms = 50;
    });
    let worker = spawn_worker("S2", PredictMode::Accept, HealthMode::Error).await;

    runtime
        .registry()
        .register_server(registration("S2", &worker, &["video"]))
        .await
        .unwrap();

    // Three failed checks take the instance offline; the registry view
    // follows via the status notification.
    let mut offline = false;
    for _ in 0..200 {
        let servers = runtime
            .registry()
            .get_available_servers(ServerFilter::default())
            .await
            .unwrap();
        if servers
            .first()
            .is_some_and(|s| s.status == ServerStatus::Offline)
        {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline, "server never went offline");

    // And selection no longer returns it.
    let picked = runtime
        .balancer()
        .select_server(&taskgate_common::types::SelectionCriteria::default())
        .await;
    assert_eq!(picked, None);
}

#[tokio::test]
async fn capacity_ceiling_rejects_excess_dispatch() {
    let runtime = test_runtime(|_| {});
    let worker = spawn_worker("S1", PredictMode::SlowAccept, HealthMode::Ok).await;

    let mut request = registration("S1", &worker, &["video"]);
    request.max_concurrent = 1;
    runtime.registry().register_server(request).await.unwrap();

    let instance = runtime
        .existing_server_instance(&ServerId::from("S1"))
        .await
        .unwrap();

    // Fill the only slot, then a second dispatch must be refused while the
    // first is still held open by the worker.
    let first = {
        let instance = Arc::clone(&instance);
        tokio::spawn(async move {
            instance
                .execute_task(
                    "T1".into(),
                    video_request(true),
                    "http://gateway.test/api/task/T1".into(),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = instance
        .execute_task(
            "T2".into(),
            video_request(true),
            "http://gateway.test/api/task/T2".into(),
        )
        .await;

    match second {
        Err(taskgate_common::GatewayError::AtCapacity(id)) => {
            assert_eq!(id, ServerId::from("S1"))
        }
        other => panic!("expected capacity rejection, got {:?}", other),
    }

    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn timeout_consumes_retries_then_sticks() {
    let runtime = test_runtime(|config| {
        config.task.timeout_ms = 100;
    });
    let worker = spawn_worker("S1", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S1", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T2");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();

    // Worker accepts but never calls back: every attempt times out until the
    // retry budget is gone.
    let mut finished = None;
    for _ in 0..600 {
        let task = instance.get_status().await.unwrap();
        if task.status == TaskStatus::Timeout && task.attempts.len() == 3 {
            finished = Some(task);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let task = finished.expect("task never exhausted its retries");
    assert_eq!(task.status, TaskStatus::Timeout);
    assert_eq!(task.attempts.len(), 3);
    assert_eq!(instance.retry_count().await, 3);
}

#[tokio::test]
async fn timeout_with_vanished_fleet_completes_exactly_once() {
    let runtime = test_runtime(|config| {
        config.task.timeout_ms = 300;
    });
    let worker = spawn_worker("S1", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S1", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T4");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();
    await_status(&runtime, &task_id, TaskStatus::Processing).await;

    // Let the dispatch POST land so unregister drains instantly.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The fleet disappears before the timeout fires, so the post-timeout
    // retry cannot find a server and the task fails at assignment.
    runtime
        .registry()
        .unregister_server(&ServerId::from("S1"))
        .await
        .unwrap();

    let failed = await_status(&runtime, &task_id, TaskStatus::Failed).await;
    assert!(failed.error.unwrap().contains("No available servers"));
    assert_eq!(failed.attempts.len(), 1);

    // The converging timeout and failed-retry paths must produce one
    // complete event, not two.
    let stats = runtime.stats_today().await.get_stats().await;
    assert_eq!(stats.counters.total_tasks, 1);
    assert_eq!(stats.counters.failed_tasks, 1);
    assert_eq!(stats.counters.pending_tasks, 0);
    assert_eq!(stats.counters.retried_tasks, 1);
}

#[tokio::test]
async fn cancel_wins_and_emits_one_failed_completion() {
    let runtime = test_runtime(|_| {});
    let worker = spawn_worker("S3", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S3", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let task_id = taskgate_common::ids::TaskId::from("T3");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();

    // Cancel immediately, racing assignment.
    instance.cancel().await.unwrap();

    let task = instance.get_status().await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // Terminal means immutable: a late worker callback is rejected.
    let late = TaskUpdate {
        status: TaskStatus::Completed,
        result: Some(json!({"output_url": "late"})),
        progress: None,
        error: None,
    };
    assert!(instance.update_task(late).await.is_err());

    // Exactly one complete event, and it was not a success.
    let stats = runtime.stats_today().await.get_stats().await;
    assert_eq!(stats.counters.failed_tasks, 1);
    assert_eq!(stats.counters.successful_tasks, 0);
}

#[tokio::test]
async fn terminal_tasks_are_purged_after_the_grace_window() {
    let runtime = test_runtime(|config| {
        config.task.cleanup_delay_ms = 100;
    });

    let task_id = taskgate_common::ids::TaskId::from("T1");
    let instance = runtime.task_instance(&task_id).await;
    instance.create_task(video_request(true)).await.unwrap();
    await_status(&runtime, &task_id, TaskStatus::Failed).await;

    let mut purged = false;
    for _ in 0..100 {
        if runtime.existing_task_instance(&task_id).await.is_none() {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(purged, "task record survived the retention window");
}

#[tokio::test]
async fn maintenance_mode_excludes_and_restores() {
    let runtime = test_runtime(|_| {});
    let worker = spawn_worker("S1", PredictMode::Accept, HealthMode::Ok).await;

    runtime
        .registry()
        .register_server(registration("S1", &worker, &["video"]))
        .await
        .unwrap();
    runtime.balancer().rebalance().await.unwrap();

    let instance = runtime
        .existing_server_instance(&ServerId::from("S1"))
        .await
        .unwrap();

    instance.set_maintenance_mode(true).await.unwrap();
    // Status notifications to the registry are fire-and-forget; let them land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let picked = runtime
        .balancer()
        .select_server(&taskgate_common::types::SelectionCriteria::default())
        .await;
    assert_eq!(picked, None);

    instance.set_maintenance_mode(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.balancer().rebalance().await.unwrap();
    let picked = runtime
        .balancer()
        .select_server(&taskgate_common::types::SelectionCriteria::default())
        .await;
    assert_eq!(picked, Some(ServerId::from("S1")));
}
