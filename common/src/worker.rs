use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// El identificador de un worker es la URL de su endpoint.
pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    #[serde(default)]
    pub url: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub registered: bool,
    pub message: String,
}

/// Métricas que manda el worker al terminar una tarea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub worker: WorkerId,
    pub task: String,
    #[serde(default)]
    pub resource: Option<String>,
    pub units: u64,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub registered_at: DateTime<Utc>,
    pub last_seen_secs_ago: u64,
    pub online: bool,
    pub has_pending_command: bool,
    pub stop_pending: bool,
    pub tasks_completed: u64,
    pub units_reported: u64,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BlockedList {
    pub blocked: Vec<WorkerId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StopResponse {
    pub ok: bool,
    pub workers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}
