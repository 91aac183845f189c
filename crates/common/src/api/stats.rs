use serde::{Deserialize, Serialize};

use crate::types::HourlyBucket;

/// Date selector for the stats endpoints, ISO `YYYY-MM-DD`.
/// Defaults to the current UTC day.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub date: Option<String>,
}

/// GET /api/stats/hourly response — one bucket per hour, 0..24.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HourlyReport {
    pub date: String,
    pub hours: Vec<HourlyBucket>,
}
