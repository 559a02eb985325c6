use anyhow::{bail, Result};
use common::{
    Command, ReportRequest, TaskSpec, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::{CancelFlag, ExecutorRegistry};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Espera exponencial para reintentos de registro.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { max, current: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Command(Command),
    /// El coordinador no nos conoce (nunca registrados o expulsados)
    Unregistered,
    Blocked,
}

#[derive(Debug, PartialEq)]
pub enum RegisterOutcome {
    Accepted,
    Blocked,
}

/// Cliente HTTP hacia el coordinador.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    worker_id: String,
}

impl CoordinatorClient {
    pub fn new(base_url: &str, worker_id: String, token: Option<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            worker_id,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn register(&self) -> Result<RegisterOutcome> {
        let resp = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&WorkerRegisterRequest {
                url: self.worker_id.clone(),
            })
            .send()
            .await?;

        match resp.status() {
            StatusCode::FORBIDDEN => Ok(RegisterOutcome::Blocked),
            s if s.is_success() => {
                let body: WorkerRegisterResponse = resp.json().await?;
                debug!("registro: {}", body.message);
                Ok(RegisterOutcome::Accepted)
            }
            s => bail!("el coordinador devolvió {} al registrar", s),
        }
    }

    pub async fn poll(&self) -> Result<PollOutcome> {
        let resp = self
            .http
            .get(format!("{}/poll", self.base_url))
            .query(&[("worker", self.worker_id.as_str())])
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(PollOutcome::Unregistered),
            StatusCode::FORBIDDEN => Ok(PollOutcome::Blocked),
            s if s.is_success() => Ok(PollOutcome::Command(resp.json().await?)),
            s => bail!("el coordinador devolvió {} al hacer poll", s),
        }
    }

    pub async fn report(&self, report: &ReportRequest) -> Result<()> {
        let Some(token) = self.token.as_deref() else {
            debug!("sin token, no se reporta la tarea {}", report.task);
            return Ok(());
        };

        let resp = self
            .http
            .post(format!("{}/report", self.base_url))
            .bearer_auth(token)
            .json(report)
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("el coordinador devolvió {} al reportar", resp.status());
        }
        Ok(())
    }
}

/// CPU y memoria del host para acompañar los reportes.
struct Telemetry(Mutex<System>);

impl Telemetry {
    fn new() -> Self {
        // sysinfo calcula el uso de CPU como diferencia entre dos lecturas:
        // sin esta primera, el primer sample siempre da 0%
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self(Mutex::new(sys))
    }

    fn sample(&self) -> (Option<f32>, Option<u64>) {
        match self.0.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (Some(sys.global_cpu_info().cpu_usage()), Some(sys.used_memory()))
            }
            Err(_) => (None, None),
        }
    }
}

struct Agent {
    api: CoordinatorClient,
    registry: ExecutorRegistry,
    slots: Arc<Semaphore>,
    running: Mutex<Vec<CancelFlag>>,
    telemetry: Telemetry,
    poll_interval: Duration,
}

impl Agent {
    fn track(&self, cancel: &CancelFlag) {
        if let Ok(mut running) = self.running.lock() {
            running.push(cancel.clone());
        }
    }

    fn untrack(&self, cancel: &CancelFlag) {
        if let Ok(mut running) = self.running.lock() {
            running.retain(|c| !c.same_as(cancel));
        }
    }

    /// Cancela todo lo que esté corriendo o esperando slot.
    fn cancel_all(&self) -> usize {
        match self.running.lock() {
            Ok(mut running) => {
                for c in running.iter() {
                    c.cancel();
                }
                let n = running.len();
                running.clear();
                n
            }
            Err(_) => 0,
        }
    }

    async fn register_until_accepted(&self) {
        let mut backoff = Backoff::new(self.poll_interval, MAX_BACKOFF.max(self.poll_interval));
        loop {
            match self.api.register().await {
                Ok(RegisterOutcome::Accepted) => {
                    info!("worker {} registrado", self.api.worker_id());
                    return;
                }
                Ok(RegisterOutcome::Blocked) => {
                    warn!("el coordinador tiene bloqueado a {}", self.api.worker_id());
                }
                Err(e) => {
                    warn!("no se pudo registrar: {:?}", e);
                }
            }
            sleep(backoff.next_delay()).await;
        }
    }
}

async fn run_task(agent: Arc<Agent>, spec: TaskSpec) {
    let cancel = CancelFlag::new();
    agent.track(&cancel);

    // esperamos slot fuera del loop de poll
    let permit = match agent.slots.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return,
    };

    if cancel.is_cancelled() {
        info!("tarea {} cancelada antes de empezar", spec.task);
        return;
    }

    info!(
        "ejecutando tarea {} (duration={}s, resource={:?})",
        spec.task, spec.duration_secs, spec.resource
    );

    let started = Instant::now();
    let registry = agent.registry.clone();
    let task = spec.clone();
    let exec_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || registry.run(&task, &exec_cancel)).await;

    drop(permit);
    agent.untrack(&cancel);

    let (units, success) = match result {
        Ok(Ok(outcome)) => {
            info!(
                "terminé tarea {}: units={} cancelada={} en {:?}",
                spec.task, outcome.units, outcome.cancelled, outcome.elapsed
            );
            (outcome.units, !outcome.cancelled)
        }
        Ok(Err(e)) => {
            warn!("error ejecutando tarea {}: {:?}", spec.task, e);
            (0, false)
        }
        Err(e) => {
            warn!("panic o join error en tarea {}: {:?}", spec.task, e);
            (0, false)
        }
    };

    let (cpu_percent, mem_bytes) = agent.telemetry.sample();
    let report = ReportRequest {
        worker: agent.api.worker_id().to_string(),
        task: spec.task.clone(),
        resource: spec.resource.clone(),
        units,
        latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
        success,
        cpu_percent,
        mem_bytes,
    };

    if let Err(e) = agent.api.report(&report).await {
        warn!("no se pudo reportar la tarea {}: {:?}", spec.task, e);
    }
}

/// Loop principal del worker.
/// - Se registra en el coordinador (con reintentos).
/// - Hace poll cada `poll_interval`; el poll también sirve de heartbeat.
/// - Ejecuta cada tarea en paralelo (hasta `concurrency`) sin frenar el poll.
/// - Si lo expulsan o bloquean, vuelve a registrarse.
pub async fn run(config: Config) -> Result<()> {
    let worker_id = config.worker_url();
    if config.token.is_none() {
        warn!("COORDINATOR_TOKEN no definido: las tareas no se van a reportar");
    }

    let registry = ExecutorRegistry::with_builtins();
    info!(
        "worker {} contra {} (concurrency={}, tareas={:?})",
        worker_id,
        config.base_url(),
        config.concurrency,
        registry.names()
    );

    let agent = Arc::new(Agent {
        api: CoordinatorClient::new(config.base_url(), worker_id, config.token.clone())?,
        registry,
        slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
        running: Mutex::new(Vec::new()),
        telemetry: Telemetry::new(),
        poll_interval: config.poll_interval(),
    });

    agent.register_until_accepted().await;

    loop {
        match agent.api.poll().await {
            Ok(PollOutcome::Command(Command::None)) => {}
            Ok(PollOutcome::Command(Command::Stop)) => {
                let n = agent.cancel_all();
                info!("stop recibido, cancelando {} tareas", n);
            }
            Ok(PollOutcome::Command(cmd)) => {
                if let Some(spec) = TaskSpec::from_command(&cmd) {
                    tokio::spawn(run_task(agent.clone(), spec));
                }
            }
            Ok(PollOutcome::Unregistered) => {
                warn!("el coordinador no nos conoce, re-registrando");
                agent.register_until_accepted().await;
            }
            Ok(PollOutcome::Blocked) => {
                warn!("bloqueado por el coordinador, esperando desbloqueo");
                agent.register_until_accepted().await;
            }
            Err(e) => {
                warn!("error haciendo poll: {:?}", e);
            }
        }

        sleep(agent.poll_interval).await;
    }
}
