//! Per-day statistics aggregation.
//!
//! One actor per ISO calendar day. Lifecycle events are buffered in memory
//! and flushed to storage in batches; aggregate counters are re-persisted on
//! every flush so recovery never depends on replaying a partial buffer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use taskgate_common::config::StatsConfig;
use taskgate_common::ids::{ServerId, TaskId};
use taskgate_common::types::{
    HourlyBucket, ServerStatistics, Statistics, StatsEvent, StatsEventKind, TaskCounters,
    TopServerEntry,
};
use taskgate_common::Result;

use crate::storage::StorageHandle;

/// How many servers the day statistics leaderboard shows.
const TOP_SERVERS: usize = 5;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct HourCounters {
    tasks: u64,
    succeeded: u64,
    failed: u64,
}

struct StatsState {
    buffer: Vec<StatsEvent>,
    counters: TaskCounters,
    servers: HashMap<ServerId, ServerStatistics>,
    hourly: HashMap<u32, HourCounters>,
    last_flush_hour: Option<u32>,
}

/// Statistics actor for one calendar day.
pub struct StatsAggregator {
    date: NaiveDate,
    config: StatsConfig,
    storage: StorageHandle,
    state: Mutex<StatsState>,
}

impl StatsAggregator {
    /// Create the aggregator and start its periodic flush loop.
    pub fn spawn(date: NaiveDate, storage: StorageHandle, config: StatsConfig) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            date,
            config,
            storage,
            state: Mutex::new(StatsState {
                buffer: Vec::new(),
                counters: TaskCounters::default(),
                servers: HashMap::new(),
                hourly: HashMap::new(),
                last_flush_hour: None,
            }),
        });

        let looped = Arc::clone(&aggregator);
        tokio::spawn(async move {
            let interval =
                std::time::Duration::from_millis(looped.config.flush_interval_ms);
            loop {
                tokio::time::sleep(interval).await;
                looped.flush_tick().await;
            }
        });

        aggregator
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Record a newly created task. The server id is unknown until
    /// assignment, so start events may carry none.
    pub async fn record_task_start(&self, task_id: TaskId, server_id: Option<ServerId>) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        state.counters.total_tasks += 1;
        state.counters.pending_tasks += 1;
        state.hourly.entry(now.hour()).or_default().tasks += 1;

        state.buffer.push(StatsEvent {
            kind: StatsEventKind::Start,
            task_id,
            server_id,
            success: false,
            duration_ms: 0,
            retries: 0,
            timestamp: now,
        });

        metrics::counter!("stats.events.start").increment(1);
        self.flush_if_full(&mut state).await;
    }

    /// Record a terminal task transition. Exactly one call per transition.
    pub async fn record_task_complete(
        &self,
        task_id: TaskId,
        server_id: Option<ServerId>,
        success: bool,
        duration_ms: u64,
        retries: u32,
    ) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        state.counters.pending_tasks = state.counters.pending_tasks.saturating_sub(1);
        if success {
            state.counters.successful_tasks += 1;
            state.counters.total_success_duration_ms += duration_ms;
        } else {
            state.counters.failed_tasks += 1;
        }
        if retries > 0 {
            state.counters.retried_tasks += 1;
        }
        state.counters.average_processing_time_ms = if state.counters.successful_tasks > 0 {
            state.counters.total_success_duration_ms as f64
                / state.counters.successful_tasks as f64
        } else {
            0.0
        };

        if let Some(ref id) = server_id {
            let entry = state.servers.entry(id.clone()).or_default();
            entry.tasks_processed += 1;
            if success {
                entry.tasks_succeeded += 1;
            } else {
                entry.tasks_failed += 1;
            }
            entry.total_duration_ms += duration_ms;
            entry.success_rate = entry.tasks_succeeded as f64 / entry.tasks_processed as f64;
            entry.average_response_time_ms =
                entry.total_duration_ms as f64 / entry.tasks_processed as f64;
            entry.last_active = Some(now);
        }

        let hour = state.hourly.entry(now.hour()).or_default();
        if success {
            hour.succeeded += 1;
        } else {
            hour.failed += 1;
        }

        state.buffer.push(StatsEvent {
            kind: StatsEventKind::Complete,
            task_id,
            server_id,
            success,
            duration_ms,
            retries,
            timestamp: now,
        });

        metrics::counter!("stats.events.complete").increment(1);
        self.flush_if_full(&mut state).await;
    }

    /// Day statistics with leaderboard and hourly trend. Flushes first.
    pub async fn get_stats(&self) -> Statistics {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;

        let mut top: Vec<TopServerEntry> = state
            .servers
            .iter()
            .map(|(id, s)| TopServerEntry {
                server_id: id.clone(),
                tasks_processed: s.tasks_processed,
                success_rate: s.success_rate,
            })
            .collect();
        top.sort_by(|a, b| b.tasks_processed.cmp(&a.tasks_processed));
        top.truncate(TOP_SERVERS);

        let mut hours: Vec<u32> = state.hourly.keys().copied().collect();
        hours.sort_unstable();
        let trend = hours
            .into_iter()
            .map(|h| bucket_for(h, state.hourly.get(&h)))
            .collect();

        Statistics {
            date: self.date.format("%Y-%m-%d").to_string(),
            counters: state.counters.clone(),
            top_servers: top,
            hourly_trend: trend,
        }
    }

    /// Rollup for one server; zeroed record when the server is unseen.
    pub async fn get_server_stats(&self, server_id: &ServerId) -> ServerStatistics {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;
        state.servers.get(server_id).cloned().unwrap_or_default()
    }

    /// All 24 hour buckets; missing hours carry zero counters.
    pub async fn get_hourly_report(&self) -> Vec<HourlyBucket> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;
        (0..24).map(|h| bucket_for(h, state.hourly.get(&h))).collect()
    }

    /// Persist counters and drain the event buffer in one transaction.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.try_flush_locked(&mut state).await
    }

    async fn flush_if_full(&self, state: &mut StatsState) {
        if state.buffer.len() >= self.config.flush_buffer_limit {
            self.flush_locked(state).await;
        }
    }

    /// Flush, logging instead of propagating — callers on the record path
    /// must never fail because persistence hiccupped.
    async fn flush_locked(&self, state: &mut StatsState) {
        if let Err(e) = self.try_flush_locked(state).await {
            tracing::warn!(date = %self.date, error = %e, "Stats flush failed, will retry");
        }
    }

    async fn try_flush_locked(&self, state: &mut StatsState) -> Result<()> {
        let mut entries = vec![
            ("stats".to_string(), serde_json::to_value(&state.counters)?),
            (
                "serverStats".to_string(),
                serde_json::to_value(&state.servers)?,
            ),
            (
                "hourlyStats".to_string(),
                serde_json::to_value(&state.hourly)?,
            ),
        ];

        if !state.buffer.is_empty() {
            entries.push((
                format!("events-{}", Utc::now().timestamp_millis()),
                serde_json::to_value(&state.buffer)?,
            ));
        }

        self.storage.put_many(entries).await?;

        // The buffer is only dropped once the batch landed.
        let drained = state.buffer.len();
        state.buffer.clear();
        if drained > 0 {
            tracing::debug!(date = %self.date, events = drained, "Flushed stats events");
        }
        metrics::counter!("stats.flushes").increment(1);

        Ok(())
    }

    /// Periodic flush; clears the hourly map when the loop first runs past
    /// midnight (the new day belongs to the next aggregator).
    async fn flush_tick(&self) {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;

        let hour = Utc::now().hour();
        if hour == 0 && state.last_flush_hour.is_some_and(|h| h != 0) {
            state.hourly.clear();
            tracing::info!(date = %self.date, "Hourly counters reset at midnight");
        }
        state.last_flush_hour = Some(hour);
    }
}

fn bucket_for(hour: u32, counters: Option<&HourCounters>) -> HourlyBucket {
    let counters = counters.cloned().unwrap_or_default();
    HourlyBucket {
        period: format!("{}:00-{}:59", hour, hour),
        tasks: counters.tasks,
        succeeded: counters.succeeded,
        failed: counters.failed,
    }
}
