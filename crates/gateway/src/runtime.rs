//! Actor addressing: kind + name → handle.
//!
//! Owns the two well-known singletons (ServerRegistry, LoadBalancer under the
//! name "global") and the keyed actor maps: one ServerInstance per server id,
//! one TaskInstance per task id, one StatsAggregator per ISO calendar day.
//! Lookups create actors on demand; every actor receives its own storage
//! namespace.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use taskgate_common::config::GatewayConfig;
use taskgate_common::ids::{ServerId, TaskId};

use crate::balancer::LoadBalancer;
use crate::registry::ServerRegistry;
use crate::server_instance::ServerInstance;
use crate::stats::StatsAggregator;
use crate::storage::{Storage, StorageHandle, TaskTable};
use crate::task_instance::TaskInstance;

/// Well-known name of the singleton actors.
pub const GLOBAL: &str = "global";

pub struct Runtime {
    config: Arc<GatewayConfig>,
    storage: Arc<dyn Storage>,
    task_table: Arc<dyn TaskTable>,
    http: reqwest::Client,
    registry: OnceLock<Arc<ServerRegistry>>,
    balancer: OnceLock<Arc<LoadBalancer>>,
    servers: Mutex<HashMap<ServerId, Arc<ServerInstance>>>,
    tasks: Mutex<HashMap<TaskId, Arc<TaskInstance>>>,
    stats: Mutex<HashMap<String, Arc<StatsAggregator>>>,
}

impl Runtime {
    pub fn new(
        config: Arc<GatewayConfig>,
        storage: Arc<dyn Storage>,
        task_table: Arc<dyn TaskTable>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let runtime = Arc::new(Self {
            config,
            storage,
            task_table,
            http,
            registry: OnceLock::new(),
            balancer: OnceLock::new(),
            servers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        });

        let registry = ServerRegistry::new(
            Arc::clone(&runtime),
            StorageHandle::new(Arc::clone(&runtime.storage), "registry", GLOBAL),
        );
        let balancer = LoadBalancer::new(
            Arc::clone(&runtime),
            StorageHandle::new(Arc::clone(&runtime.storage), "balancer", GLOBAL),
        );

        let _ = runtime.registry.set(registry);
        let _ = runtime.balancer.set(balancer);

        runtime
    }

    /// Spawn the recurring maintenance work: stale-server sweeps and
    /// balancer rebalances. Stats flush loops start with each aggregator.
    pub fn start_background_loops(self: &Arc<Self>) {
        ServerRegistry::run_cleanup_loop(
            self.registry(),
            self.config.registry.cleanup_interval_ms,
        );
        LoadBalancer::run_rebalance_loop(
            self.balancer(),
            self.config.balancer.rebalance_interval_ms,
        );
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn task_table(&self) -> &Arc<dyn TaskTable> {
        &self.task_table
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        Arc::clone(self.registry.get().expect("runtime registry not wired"))
    }

    pub fn balancer(&self) -> Arc<LoadBalancer> {
        Arc::clone(self.balancer.get().expect("runtime balancer not wired"))
    }

    /// Handle for the server instance with the given id, created on demand.
    pub async fn server_instance(self: &Arc<Self>, id: &ServerId) -> Arc<ServerInstance> {
        let mut servers = self.servers.lock().await;
        if let Some(instance) = servers.get(id) {
            return Arc::clone(instance);
        }

        let instance = ServerInstance::new(
            id.clone(),
            Arc::clone(self),
            StorageHandle::new(Arc::clone(&self.storage), "server", id.as_str()),
        );
        servers.insert(id.clone(), Arc::clone(&instance));
        instance
    }

    pub async fn existing_server_instance(&self, id: &ServerId) -> Option<Arc<ServerInstance>> {
        self.servers.lock().await.get(id).cloned()
    }

    pub async fn remove_server_instance(&self, id: &ServerId) {
        self.servers.lock().await.remove(id);
    }

    /// Handle for the task instance with the given id, created on demand.
    pub async fn task_instance(self: &Arc<Self>, id: &TaskId) -> Arc<TaskInstance> {
        let mut tasks = self.tasks.lock().await;
        if let Some(instance) = tasks.get(id) {
            return Arc::clone(instance);
        }

        let instance = TaskInstance::new(
            id.clone(),
            Arc::clone(self),
            StorageHandle::new(Arc::clone(&self.storage), "task", id.as_str()),
        );
        tasks.insert(id.clone(), Arc::clone(&instance));
        instance
    }

    pub async fn existing_task_instance(&self, id: &TaskId) -> Option<Arc<TaskInstance>> {
        self.tasks.lock().await.get(id).cloned()
    }

    pub async fn remove_task_instance(&self, id: &TaskId) {
        self.tasks.lock().await.remove(id);
    }

    /// Aggregator for the given calendar day, created on demand.
    pub async fn stats_for(self: &Arc<Self>, date: NaiveDate) -> Arc<StatsAggregator> {
        let name = date.format("%Y-%m-%d").to_string();
        let mut stats = self.stats.lock().await;
        if let Some(aggregator) = stats.get(&name) {
            return Arc::clone(aggregator);
        }

        let aggregator = StatsAggregator::spawn(
            date,
            StorageHandle::new(Arc::clone(&self.storage), "stats", &name),
            self.config.stats.clone(),
        );
        stats.insert(name, Arc::clone(&aggregator));
        aggregator
    }

    /// Aggregator for the current UTC day.
    pub async fn stats_today(self: &Arc<Self>) -> Arc<StatsAggregator> {
        self.stats_for(Utc::now().date_naive()).await
    }
}
