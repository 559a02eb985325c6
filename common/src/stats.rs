use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unidades procesadas en un minuto cerrado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteCount {
    pub minute: DateTime<Utc>,
    pub units: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Unidades reportadas en el último segundo
    pub current_throughput: u64,
    pub peak_throughput: u64,
    /// Unidades del último minuto cerrado
    pub units_last_minute: u64,
    pub peak_units_per_minute: u64,
    pub minute_history: Vec<MinuteCount>,

    pub total_units: u64,
    pub total_reports: u64,
    pub tasks_issued: u64,
    pub stops_issued: u64,

    pub by_task_type: BTreeMap<String, u64>,
    pub by_resource: BTreeMap<String, u64>,
    pub mean_latency_ms: Option<f64>,

    pub workers_registered: usize,
    pub workers_online: usize,
    pub workers_blocked: usize,

    pub uptime_secs: u64,
    pub generated_at: Option<DateTime<Utc>>,
}
