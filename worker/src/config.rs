use clap::Parser;
use std::time::Duration;

/// Worker de la flota: se registra, hace poll y ejecuta tareas locales
#[derive(Parser, Debug, Clone)]
#[command(name = "worker", version)]
pub struct Config {
    /// URL base del coordinador
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    pub coordinator: String,

    /// Identificador de este worker (la URL de su endpoint); por defecto http://<hostname>
    #[arg(long, env = "WORKER_URL")]
    pub url: Option<String>,

    /// Token para reportar métricas al coordinador
    #[arg(long, env = "COORDINATOR_TOKEN")]
    pub token: Option<String>,

    /// Intervalo entre polls, en milisegundos
    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    /// Tareas en paralelo como máximo
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 2)]
    pub concurrency: usize,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn base_url(&self) -> &str {
        self.coordinator.trim_end_matches('/')
    }

    pub fn worker_url(&self) -> String {
        match self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => u.to_string(),
            None => {
                let host = hostname::get()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string();
                format!("http://{}", if host.is_empty() { "localhost" } else { host.as_str() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_url_wins() {
        let cfg = Config::try_parse_from([
            "worker",
            "--coordinator",
            "http://coord:8080/",
            "--url",
            "http://node-3:9000",
        ])
        .unwrap();
        assert_eq!(cfg.base_url(), "http://coord:8080");
        assert_eq!(cfg.worker_url(), "http://node-3:9000");
    }

    #[test]
    fn default_url_comes_from_hostname() {
        let cfg = Config::try_parse_from(["worker", "--url", " "]).unwrap();
        assert!(cfg.worker_url().starts_with("http://"));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(2));
    }
}
