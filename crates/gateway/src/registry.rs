//! Fleet membership.
//!
//! Single actor under the well-known name "global"; the source of truth for
//! which servers exist, their group indexes, and their last heartbeat. Stale
//! members are reclassified offline on read and evicted by a periodic sweep.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use taskgate_common::api::servers::RegisterServerRequest;
use taskgate_common::ids::ServerId;
use taskgate_common::types::{ServerFilter, ServerInfo, ServerStatus};
use taskgate_common::{GatewayError, Result};

use crate::runtime::Runtime;
use crate::storage::StorageHandle;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerRecord {
    config: taskgate_common::types::ServerConfig,
    status: ServerStatus,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl ServerRecord {
    fn info(&self, now: DateTime<Utc>) -> ServerInfo {
        ServerInfo {
            config: self.config.clone(),
            status: self.status,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
            uptime_ms: (now - self.registered_at).num_milliseconds().max(0) as u64,
            time_since_last_heartbeat_ms: (now - self.last_heartbeat).num_milliseconds().max(0)
                as u64,
        }
    }
}

struct RegistryState {
    servers: HashMap<ServerId, ServerRecord>,
    groups: HashMap<String, BTreeSet<ServerId>>,
}

/// The fleet registry actor.
pub struct ServerRegistry {
    runtime: Arc<Runtime>,
    storage: StorageHandle,
    state: Mutex<RegistryState>,
}

impl ServerRegistry {
    pub fn new(runtime: Arc<Runtime>, storage: StorageHandle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            storage,
            state: Mutex::new(RegistryState {
                servers: HashMap::new(),
                groups: HashMap::new(),
            }),
        })
    }

    /// Register (or re-register) a backend worker. Generates an id when the
    /// request carries none, initializes the ServerInstance, and indexes the
    /// server under its groups.
    pub async fn register_server(&self, request: RegisterServerRequest) -> Result<ServerId> {
        validate_registration(&request)?;

        let id = request.id.clone().unwrap_or_else(ServerId::generate);
        let config = request.into_config(id.clone());

        // Initialization failures abort registration entirely.
        let instance = self.runtime.server_instance(&id).await;
        instance.initialize(config.clone()).await?;

        {
            let mut state = self.state.lock().await;
            let now = Utc::now();

            for members in state.groups.values_mut() {
                members.remove(&id);
            }
            for group in &config.groups {
                state
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .insert(id.clone());
            }
            state.groups.retain(|_, members| !members.is_empty());

            state.servers.insert(
                id.clone(),
                ServerRecord {
                    config,
                    status: ServerStatus::Online,
                    registered_at: now,
                    last_heartbeat: now,
                },
            );

            self.persist_locked(&state).await?;
        }

        metrics::counter!("registry.registrations").increment(1);
        tracing::info!(server_id = %id, "Server registered");
        self.notify_rebalance();

        Ok(id)
    }

    /// Remove a server from the fleet. Unknown ids are a no-op success;
    /// instance shutdown failures are logged, membership removal wins.
    pub async fn unregister_server(&self, id: &ServerId) -> Result<()> {
        if let Some(instance) = self.runtime.existing_server_instance(id).await {
            if let Err(e) = instance.shutdown().await {
                tracing::warn!(server_id = %id, error = %e, "Shutdown during unregister failed");
            }
        }

        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.servers.remove(id).is_some();
            for members in state.groups.values_mut() {
                members.remove(id);
            }
            state.groups.retain(|_, members| !members.is_empty());
            if removed {
                self.persist_locked(&state).await?;
            }
            removed
        };

        self.runtime.remove_server_instance(id).await;

        if removed {
            tracing::info!(server_id = %id, "Server unregistered");
            self.notify_rebalance();
        }
        Ok(())
    }

    /// The fleet view. Servers silent beyond the stale threshold are
    /// reclassified offline before filtering.
    pub async fn get_available_servers(&self, filter: ServerFilter) -> Result<Vec<ServerInfo>> {
        let stale_threshold = self.runtime.config().registry.stale_threshold_ms as i64;
        let now = Utc::now();

        let mut state = self.state.lock().await;

        let mut reclassified = false;
        for (id, record) in state.servers.iter_mut() {
            let silent_ms = (now - record.last_heartbeat).num_milliseconds();
            if silent_ms > stale_threshold && record.status != ServerStatus::Offline {
                tracing::warn!(server_id = %id, silent_ms, "Server heartbeat stale, marking offline");
                record.status = ServerStatus::Offline;
                reclassified = true;
            }
        }
        if reclassified {
            if let Err(e) = self.persist_locked(&state).await {
                tracing::warn!(error = %e, "Failed to persist stale reclassification");
            }
        }

        let mut servers: Vec<ServerInfo> = state
            .servers
            .values()
            .filter(|record| {
                if let Some(status) = filter.status {
                    if record.status != status {
                        return false;
                    }
                }
                if let Some(ref group) = filter.group {
                    if !record.config.groups.contains(group) {
                        return false;
                    }
                }
                if let Some(max_age) = filter.max_age_ms {
                    let age = (now - record.last_heartbeat).num_milliseconds().max(0) as u64;
                    if age > max_age {
                        return false;
                    }
                }
                true
            })
            .map(|record| record.info(now))
            .collect();

        servers.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        Ok(servers)
    }

    /// Record a heartbeat. A silent-then-heard server flips back online.
    pub async fn update_heartbeat(&self, id: &ServerId) -> Result<()> {
        let was_offline = {
            let mut state = self.state.lock().await;
            let record = state.servers.get_mut(id).ok_or_else(|| {
                GatewayError::NotFound(format!("server {} is not registered", id))
            })?;

            record.last_heartbeat = Utc::now();
            let was_offline = record.status == ServerStatus::Offline;
            if was_offline {
                record.status = ServerStatus::Online;
                tracing::info!(server_id = %id, "Server back online after heartbeat");
            }

            self.persist_locked(&state).await?;
            was_offline
        };

        if was_offline {
            self.notify_rebalance();
        }
        Ok(())
    }

    /// Evict every server whose heartbeat exceeded the stale threshold.
    /// Returns the removed ids.
    pub async fn cleanup_stale_servers(&self) -> Result<Vec<ServerId>> {
        let stale_threshold = self.runtime.config().registry.stale_threshold_ms as i64;
        let now = Utc::now();

        let stale: Vec<ServerId> = {
            let state = self.state.lock().await;
            state
                .servers
                .iter()
                .filter(|(_, record)| {
                    (now - record.last_heartbeat).num_milliseconds() > stale_threshold
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &stale {
            tracing::warn!(server_id = %id, "Evicting stale server");
            self.unregister_server(id).await?;
        }

        if !stale.is_empty() {
            metrics::counter!("registry.stale_evictions").increment(stale.len() as u64);
        }
        Ok(stale)
    }

    /// Mirror a status transition reported by the server's own instance.
    pub async fn reflect_instance_status(&self, id: &ServerId, status: ServerStatus) {
        let changed = {
            let mut state = self.state.lock().await;
            match state.servers.get_mut(id) {
                Some(record) if record.status != status => {
                    record.status = status;
                    if let Err(e) = self.persist_locked(&state).await {
                        tracing::warn!(server_id = %id, error = %e, "Failed to persist status change");
                    }
                    true
                }
                _ => false,
            }
        };

        if changed {
            tracing::info!(server_id = %id, status = status.as_str(), "Fleet status updated");
            self.notify_rebalance();
        }
    }

    /// Periodic stale sweep, errors logged and swallowed.
    pub fn run_cleanup_loop(registry: Arc<Self>, interval_ms: u64) {
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                match registry.cleanup_stale_servers().await {
                    Ok(removed) if !removed.is_empty() => {
                        tracing::info!(count = removed.len(), "Stale servers evicted");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Stale sweep failed"),
                }
            }
        });
    }

    /// Rebalance is an optimization; failures must never surface here.
    fn notify_rebalance(&self) {
        let balancer = self.runtime.balancer();
        tokio::spawn(async move {
            if let Err(e) = balancer.rebalance().await {
                tracing::warn!(error = %e, "Rebalance notification failed");
            }
        });
    }

    async fn persist_locked(&self, state: &RegistryState) -> Result<()> {
        self.storage
            .put_many(vec![
                ("servers".into(), serde_json::to_value(&state.servers)?),
                ("groups".into(), serde_json::to_value(&state.groups)?),
            ])
            .await
    }
}

fn validate_registration(request: &RegisterServerRequest) -> Result<()> {
    let mut problems: Vec<String> = Vec::new();

    if request.name.trim().is_empty() {
        problems.push("name must not be empty".into());
    }
    if request.max_concurrent < 1 {
        problems.push("maxConcurrent must be >= 1".into());
    }
    if request.priority > 10 {
        problems.push("priority must be between 0 and 10".into());
    }
    if request.endpoints.predict.trim().is_empty() {
        problems.push("endpoints.predict must not be empty".into());
    }
    if request.endpoints.health.trim().is_empty() {
        problems.push("endpoints.health must not be empty".into());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::Validation(problems.join("; ")))
    }
}
