use clap::Parser;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::limiter::RateLimiterConfig;
use crate::state::CoordinatorSettings;

/// Coordinador de tareas para una flota de workers
#[derive(Parser, Debug, Clone)]
#[command(name = "coordinator", version)]
pub struct Config {
    /// Dirección donde escucha la API HTTP
    #[arg(long, env = "COORDINATOR_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Secreto compartido para los endpoints protegidos (si falta, se genera uno)
    #[arg(long, env = "COORDINATOR_TOKEN")]
    pub auth_token: Option<String>,

    /// Segundos sin contacto antes de expulsar a un worker
    #[arg(long, env = "COORDINATOR_WORKER_TIMEOUT_SECS", default_value_t = 30)]
    pub worker_timeout_secs: u64,

    /// Cada cuánto corre el barrido de heartbeats
    #[arg(long, env = "COORDINATOR_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    pub sweep_interval_secs: u64,

    /// Duración máxima aceptada para una tarea
    #[arg(long, env = "COORDINATOR_MAX_DURATION_SECS", default_value_t = 3600)]
    pub max_duration_secs: u64,

    /// Tipos de tarea aceptados
    #[arg(
        long,
        env = "COORDINATOR_TASK_TYPES",
        value_delimiter = ',',
        default_value = "noop,sleep,checksum"
    )]
    pub task_types: Vec<String>,

    /// Requests permitidas por cliente en cada ventana (endpoints protegidos)
    #[arg(long, env = "COORDINATOR_RATE_LIMIT", default_value_t = 100)]
    pub rate_limit: u32,

    /// Largo de la ventana del rate limit, en segundos
    #[arg(long, env = "COORDINATOR_RATE_WINDOW_SECS", default_value_t = 900)]
    pub rate_window_secs: u64,
}

impl Config {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn limits(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.rate_limit.max(1),
            window: Duration::from_secs(self.rate_window_secs.max(1)),
        }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            max_duration_secs: self.max_duration_secs,
            task_types: self
                .task_types
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<HashSet<_>>(),
            ..CoordinatorSettings::default()
        }
    }
}
