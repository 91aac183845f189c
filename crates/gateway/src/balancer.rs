//! Server selection.
//!
//! Single actor under the well-known name "global". Ranks candidates from the
//! registry's fleet view with the configured algorithm, tracks in-flight load
//! per server, and caches the metrics snapshots the instances push to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;

use taskgate_common::api::balancer::BalancerStatus;
use taskgate_common::ids::ServerId;
use taskgate_common::types::{
    BalancerAlgorithm, SelectionCriteria, ServerFilter, ServerMetrics, ServerStatus,
};
use taskgate_common::Result;

use crate::runtime::Runtime;
use crate::storage::StorageHandle;

struct CachedMetrics {
    metrics: ServerMetrics,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
}

struct BalancerState {
    algorithm: BalancerAlgorithm,
    weights: HashMap<ServerId, u32>,
    loads: HashMap<ServerId, u32>,
    metrics: HashMap<ServerId, CachedMetrics>,
    healthy: HashSet<ServerId>,
    cursor: usize,
}

/// The load balancer actor.
pub struct LoadBalancer {
    runtime: Arc<Runtime>,
    storage: StorageHandle,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(runtime: Arc<Runtime>, storage: StorageHandle) -> Arc<Self> {
        let algorithm = runtime.config().balancer.default_algorithm;
        Arc::new(Self {
            runtime,
            storage,
            state: Mutex::new(BalancerState {
                algorithm,
                weights: HashMap::new(),
                loads: HashMap::new(),
                metrics: HashMap::new(),
                healthy: HashSet::new(),
                cursor: 0,
            }),
        })
    }

    /// Pick a server for the given criteria, or None when nothing qualifies.
    ///
    /// Never fails: a registry hiccup falls back to the cached healthy set,
    /// and an empty candidate list is a normal outcome the caller maps to a
    /// task failure.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Option<ServerId> {
        // Refresh the healthy set from the fleet authority first.
        let refreshed = match self
            .runtime
            .registry()
            .get_available_servers(ServerFilter::online())
            .await
        {
            Ok(servers) => Some(
                servers
                    .into_iter()
                    .map(|info| info.config.id)
                    .collect::<HashSet<_>>(),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Healthy-set refresh failed, using cached set");
                None
            }
        };

        let mut state = self.state.lock().await;
        if let Some(healthy) = refreshed {
            state.healthy = healthy;
        }

        let mut candidates: Vec<Candidate> = state
            .healthy
            .iter()
            .filter_map(|id| {
                let cached = state.metrics.get(id)?;
                let load = state.loads.get(id).copied().unwrap_or(0);
                if load >= cached.metrics.max_concurrent {
                    return None;
                }
                let capable = criteria
                    .required_capabilities
                    .iter()
                    .all(|cap| cached.metrics.capabilities.contains(cap));
                if !capable {
                    return None;
                }
                Some(Candidate {
                    id: id.clone(),
                    weight: state.weights.get(id).copied().unwrap_or(1),
                    load,
                    average_response_time_ms: if cached.metrics.tasks_processed > 0 {
                        Some(cached.metrics.average_response_time_ms)
                    } else {
                        None
                    },
                })
            })
            .collect();

        // Stable order so cursor arithmetic and tie-breaks are deterministic.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        if candidates.is_empty() {
            metrics::counter!("balancer.selections", "outcome" => "none").increment(1);
            return None;
        }

        let (selected, next_cursor) = pick(state.algorithm, &candidates, state.cursor);
        state.cursor = next_cursor;
        *state.loads.entry(selected.clone()).or_insert(0) += 1;

        metrics::counter!("balancer.selections", "outcome" => "hit").increment(1);
        tracing::debug!(
            server_id = %selected,
            algorithm = state.algorithm.as_str(),
            "Server selected"
        );

        // Persist off the hot path; the caller is not blocked on storage.
        self.spawn_persist(&state);

        Some(selected)
    }

    /// Merge a metrics push from a server instance.
    pub async fn update_server_metrics(&self, id: &ServerId, metrics: ServerMetrics) {
        let mut state = self.state.lock().await;

        state.weights.insert(id.clone(), compute_weight(&metrics));
        if metrics.healthy {
            state.healthy.insert(id.clone());
        } else {
            state.healthy.remove(id);
        }
        if metrics.task_completed {
            let load = state.loads.entry(id.clone()).or_insert(0);
            *load = load.saturating_sub(1);
        }
        state.metrics.insert(
            id.clone(),
            CachedMetrics {
                metrics,
                updated_at: Utc::now(),
            },
        );

        if let Err(e) = self.persist_locked(&state).await {
            tracing::warn!(server_id = %id, error = %e, "Failed to persist balancer state");
        }
    }

    /// Drop a server from rotation immediately.
    pub async fn mark_server_unhealthy(&self, id: &ServerId) {
        let mut state = self.state.lock().await;
        state.healthy.remove(id);
        state.weights.insert(id.clone(), 0);

        if let Err(e) = self.persist_locked(&state).await {
            tracing::warn!(server_id = %id, error = %e, "Failed to persist balancer state");
        }
        tracing::info!(server_id = %id, "Server marked unhealthy");
    }

    /// Re-derive balancer state from the registry: reset the healthy set,
    /// seed entries for newly seen servers, prune departed ones.
    pub async fn rebalance(&self) -> Result<()> {
        let fleet = self
            .runtime
            .registry()
            .get_available_servers(ServerFilter::default())
            .await?;

        let mut state = self.state.lock().await;

        state.healthy = fleet
            .iter()
            .filter(|info| info.status == ServerStatus::Online)
            .map(|info| info.config.id.clone())
            .collect();

        for info in &fleet {
            if state.metrics.contains_key(&info.config.id) {
                continue;
            }
            let seed = seed_metrics(info.status, &info.config.capabilities, info.config.max_concurrent);
            state
                .weights
                .insert(info.config.id.clone(), compute_weight(&seed));
            state.metrics.insert(
                info.config.id.clone(),
                CachedMetrics {
                    metrics: seed,
                    updated_at: Utc::now(),
                },
            );
        }

        let registered: HashSet<&ServerId> = fleet.iter().map(|info| &info.config.id).collect();
        state.metrics.retain(|id, _| registered.contains(id));
        state.weights.retain(|id, _| registered.contains(id));
        state.loads.retain(|id, _| registered.contains(id));
        state.healthy.retain(|id| registered.contains(id));

        metrics::gauge!("balancer.healthy_servers").set(state.healthy.len() as f64);
        self.persist_locked(&state).await?;

        tracing::debug!(
            healthy = state.healthy.len(),
            tracked = state.metrics.len(),
            "Rebalance complete"
        );
        Ok(())
    }

    pub async fn set_algorithm(&self, algorithm: BalancerAlgorithm) {
        let mut state = self.state.lock().await;
        state.algorithm = algorithm;
        state.cursor = 0;

        if let Err(e) = self.persist_locked(&state).await {
            tracing::warn!(error = %e, "Failed to persist balancer state");
        }
        tracing::info!(algorithm = algorithm.as_str(), "Balancing algorithm changed");
    }

    /// Real cached state for the status endpoint.
    pub async fn status(&self) -> BalancerStatus {
        let state = self.state.lock().await;

        let mut healthy: Vec<ServerId> = state.healthy.iter().cloned().collect();
        healthy.sort();

        BalancerStatus {
            algorithm: state.algorithm,
            healthy_servers: healthy,
            server_loads: state
                .loads
                .iter()
                .map(|(id, load)| (id.to_string(), *load))
                .collect(),
        }
    }

    /// Current in-flight load for one server.
    pub async fn load_of(&self, id: &ServerId) -> u32 {
        self.state.lock().await.loads.get(id).copied().unwrap_or(0)
    }

    /// Periodic rebalance, errors logged and swallowed.
    pub fn run_rebalance_loop(balancer: Arc<Self>, interval_ms: u64) {
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = balancer.rebalance().await {
                    tracing::warn!(error = %e, "Periodic rebalance failed");
                }
            }
        });
    }

    fn spawn_persist(&self, state: &BalancerState) {
        let storage = self.storage.clone();
        let entries = persist_entries(state);
        tokio::spawn(async move {
            match entries {
                Ok(entries) => {
                    if let Err(e) = storage.put_many(entries).await {
                        tracing::warn!(error = %e, "Failed to persist balancer state");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode balancer state"),
            }
        });
    }

    async fn persist_locked(&self, state: &BalancerState) -> Result<()> {
        self.storage.put_many(persist_entries(state)?).await
    }
}

fn persist_entries(
    state: &BalancerState,
) -> Result<Vec<(String, serde_json::Value)>> {
    let mut healthy: Vec<&ServerId> = state.healthy.iter().collect();
    healthy.sort();

    Ok(vec![
        (
            "algorithm".into(),
            serde_json::to_value(state.algorithm)?,
        ),
        ("weights".into(), serde_json::to_value(&state.weights)?),
        ("healthyServers".into(), serde_json::to_value(&healthy)?),
    ])
}

/// Candidate row handed to the selection algorithms.
struct Candidate {
    id: ServerId,
    weight: u32,
    load: u32,
    /// None until the server has processed at least one task.
    average_response_time_ms: Option<f64>,
}

/// Apply the algorithm to a non-empty, id-sorted candidate list.
/// Returns the selected id and the advanced cursor.
fn pick(
    algorithm: BalancerAlgorithm,
    candidates: &[Candidate],
    cursor: usize,
) -> (ServerId, usize) {
    match algorithm {
        BalancerAlgorithm::RoundRobin => {
            let id = candidates[cursor % candidates.len()].id.clone();
            (id, cursor.wrapping_add(1))
        }
        BalancerAlgorithm::WeightedRoundRobin => {
            // Weight 0 excludes; every survivor appears `weight` times.
            let expanded: Vec<&ServerId> = candidates
                .iter()
                .filter(|c| c.weight > 0)
                .flat_map(|c| std::iter::repeat(&c.id).take(c.weight.max(1) as usize))
                .collect();
            if expanded.is_empty() {
                // All weights zeroed; degrade to plain rotation.
                let id = candidates[cursor % candidates.len()].id.clone();
                return (id, cursor.wrapping_add(1));
            }
            let id = expanded[cursor % expanded.len()].clone();
            (id, cursor.wrapping_add(1))
        }
        BalancerAlgorithm::LeastConnections => {
            let id = candidates
                .iter()
                .min_by_key(|c| c.load)
                .map(|c| c.id.clone())
                .expect("non-empty candidate list");
            (id, cursor)
        }
        BalancerAlgorithm::ResponseTime => {
            let id = candidates
                .iter()
                .min_by(|a, b| {
                    let a = a.average_response_time_ms.unwrap_or(f64::INFINITY);
                    let b = b.average_response_time_ms.unwrap_or(f64::INFINITY);
                    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|c| c.id.clone())
                .expect("non-empty candidate list");
            (id, cursor)
        }
        BalancerAlgorithm::Random => {
            let idx = rand::rng().random_range(0..candidates.len());
            (candidates[idx].id.clone(), cursor)
        }
    }
}

/// weight = round((successRate × 10 + max(0, 10 − avgResponse_s)) / 2).
/// Falls monotonically as the success rate drops or response time rises.
fn compute_weight(metrics: &ServerMetrics) -> u32 {
    let speed = (10.0 - metrics.average_response_time_ms / 1000.0).max(0.0);
    ((metrics.success_rate * 10.0 + speed) / 2.0).round() as u32
}

/// Snapshot assumed for a server the balancer has not heard from yet.
fn seed_metrics(status: ServerStatus, capabilities: &[String], max_concurrent: u32) -> ServerMetrics {
    ServerMetrics {
        tasks_processed: 0,
        tasks_succeeded: 0,
        tasks_failed: 0,
        success_rate: 1.0,
        average_response_time_ms: 0.0,
        health_score: 100,
        active_tasks: 0,
        status,
        healthy: status == ServerStatus::Online,
        capabilities: capabilities.to_vec(),
        max_concurrent,
        task_completed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, weight: u32, load: u32, avg: Option<f64>) -> Candidate {
        Candidate {
            id: id.into(),
            weight,
            load,
            average_response_time_ms: avg,
        }
    }

    #[test]
    fn round_robin_rotates_in_order() {
        let candidates = vec![
            candidate("a", 3, 0, None),
            candidate("b", 1, 0, None),
            candidate("c", 7, 0, None),
        ];

        let mut cursor = 0;
        let mut picks = Vec::new();
        for _ in 0..4 {
            let (id, next) = pick(BalancerAlgorithm::RoundRobin, &candidates, cursor);
            picks.push(id.to_string());
            cursor = next;
        }

        // Plain rotation ignores weights entirely.
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn weighted_round_robin_repeats_by_weight_and_excludes_zero() {
        let candidates = vec![
            candidate("a", 2, 0, None),
            candidate("b", 0, 0, None),
            candidate("c", 1, 0, None),
        ];

        let mut cursor = 0;
        let mut picks = Vec::new();
        for _ in 0..6 {
            let (id, next) = pick(BalancerAlgorithm::WeightedRoundRobin, &candidates, cursor);
            picks.push(id.to_string());
            cursor = next;
        }

        assert_eq!(picks, vec!["a", "a", "c", "a", "a", "c"]);
        assert!(!picks.contains(&"b".to_string()));
    }

    #[test]
    fn least_connections_picks_smallest_load() {
        let candidates = vec![
            candidate("a", 1, 4, None),
            candidate("b", 1, 1, None),
            candidate("c", 1, 2, None),
        ];

        let (id, _) = pick(BalancerAlgorithm::LeastConnections, &candidates, 9);
        assert_eq!(id.as_str(), "b");
    }

    #[test]
    fn least_connections_ties_break_by_order() {
        let candidates = vec![
            candidate("a", 1, 1, None),
            candidate("b", 1, 1, None),
        ];

        let (id, _) = pick(BalancerAlgorithm::LeastConnections, &candidates, 0);
        assert_eq!(id.as_str(), "a");
    }

    #[test]
    fn response_time_ranks_missing_metrics_last() {
        let candidates = vec![
            candidate("a", 1, 0, None),
            candidate("b", 1, 0, Some(420.0)),
            candidate("c", 1, 0, Some(80.0)),
        ];

        let (id, _) = pick(BalancerAlgorithm::ResponseTime, &candidates, 0);
        assert_eq!(id.as_str(), "c");
    }

    #[test]
    fn random_picks_a_candidate() {
        let candidates = vec![candidate("a", 1, 0, None), candidate("b", 1, 0, None)];

        for _ in 0..10 {
            let (id, cursor) = pick(BalancerAlgorithm::Random, &candidates, 0);
            assert!(id.as_str() == "a" || id.as_str() == "b");
            assert_eq!(cursor, 0);
        }
    }

    #[test]
    fn weight_formula_is_monotone() {
        let mut fast = seed_metrics(ServerStatus::Online, &[], 1);
        fast.success_rate = 1.0;
        fast.average_response_time_ms = 100.0;
        assert_eq!(compute_weight(&fast), 10);

        let mut slow = fast.clone();
        slow.average_response_time_ms = 5_000.0;
        assert!(compute_weight(&slow) < compute_weight(&fast));

        let mut flaky = fast.clone();
        flaky.success_rate = 0.2;
        assert!(compute_weight(&flaky) < compute_weight(&fast));

        let mut dead = fast.clone();
        dead.success_rate = 0.0;
        dead.average_response_time_ms = 60_000.0;
        assert_eq!(compute_weight(&dead), 0);
    }
}
