// coordinator/src/state.rs

use chrono::{DateTime, Utc};
use common::{Command, StatsSnapshot, WorkerId, WorkerInfo};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use crate::error::CoordinatorError;
use crate::limiter::RateLimiter;
use crate::stats::StatsAggregator;

/// Estado compartido que reciben los handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub auth_token: Arc<str>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        coordinator: Coordinator,
        auth_token: impl Into<Arc<str>>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            auth_token: auth_token.into(),
            limiter: Arc::new(limiter),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Sin contacto durante más de esto => se expulsa
    pub worker_timeout: Duration,
    /// Visto hace menos de esto => cuenta como online en las stats
    pub online_window: Duration,
    pub max_duration_secs: u64,
    pub task_types: HashSet<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(30),
            online_window: Duration::from_secs(10),
            max_duration_secs: 3600,
            task_types: ["noop", "sleep", "checksum"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub registered_at: DateTime<Utc>,
    pub last_seen: SystemTime,

    // Métricas
    pub tasks_completed: u64,
    pub units_reported: u64,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub task_type: String,
    pub resource: Option<String>,
    pub duration_secs: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingCommand {
    fn into_command(self) -> Command {
        Command::Task {
            task: self.task_type,
            resource: self.resource,
            duration: self.duration_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Nunca se registró o fue expulsado por timeout
    Unregistered,
    Registered,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Refreshed,
}

struct Inner {
    workers: HashMap<WorkerId, WorkerMeta>,
    // como mucho un comando pendiente por worker
    pending: HashMap<WorkerId, PendingCommand>,
    stops: HashSet<WorkerId>,
    blocked: BTreeSet<WorkerId>,
    stats: StatsAggregator,
}

impl Inner {
    fn status(&self, id: &str) -> WorkerStatus {
        if self.blocked.contains(id) {
            WorkerStatus::Blocked
        } else if self.workers.contains_key(id) {
            WorkerStatus::Registered
        } else {
            WorkerStatus::Unregistered
        }
    }

    fn require_registered(&self, id: &str) -> Result<(), CoordinatorError> {
        match self.status(id) {
            WorkerStatus::Registered => Ok(()),
            WorkerStatus::Blocked => Err(CoordinatorError::Blocked(id.to_string())),
            WorkerStatus::Unregistered => Err(CoordinatorError::NotFound(id.to_string())),
        }
    }

    fn forget(&mut self, id: &str) -> bool {
        self.pending.remove(id);
        self.stops.remove(id);
        self.workers.remove(id).is_some()
    }
}

/// Registro, cola de comandos y estadísticas detrás de un único mutex.
///
/// Toda mutación (handlers, barrido de heartbeats, rollover de stats) pasa
/// por el mismo lock, así que nunca hay dos escrituras compitiendo por el
/// mismo worker. Ninguna operación bloquea más allá de ese lock.
pub struct Coordinator {
    settings: CoordinatorSettings,
    started_at: SystemTime,
    inner: Mutex<Inner>,
}

fn require_id(id: &str) -> Result<&str, CoordinatorError> {
    let id = id.trim();
    if id.is_empty() {
        Err(CoordinatorError::Validation("falta el id del worker".into()))
    } else {
        Ok(id)
    }
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, now: SystemTime) -> Self {
        Self {
            settings,
            started_at: now,
            inner: Mutex::new(Inner {
                workers: HashMap::new(),
                pending: HashMap::new(),
                stops: HashSet::new(),
                blocked: BTreeSet::new(),
                stats: StatsAggregator::new(now),
            }),
        }
    }

    // un handler que paniquea no debe dejar al coordinador inutilizable
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uptime(&self, now: SystemTime) -> Duration {
        now.duration_since(self.started_at).unwrap_or_default()
    }

    /* ---------------- registro ---------------- */

    pub fn register(&self, id: &str, now: SystemTime) -> Result<Registration, CoordinatorError> {
        let id = require_id(id)?;
        let mut inner = self.lock();

        if inner.blocked.contains(id) {
            return Err(CoordinatorError::Blocked(id.to_string()));
        }

        if let Some(meta) = inner.workers.get_mut(id) {
            meta.last_seen = now;
            return Ok(Registration::Refreshed);
        }

        inner.workers.insert(
            id.to_string(),
            WorkerMeta {
                registered_at: DateTime::<Utc>::from(now),
                last_seen: now,
                tasks_completed: 0,
                units_reported: 0,
                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
        Ok(Registration::New)
    }

    /// Refresca `last_seen`; devuelve false si el worker no está registrado.
    pub fn touch(&self, id: &str, now: SystemTime) -> bool {
        let Ok(id) = require_id(id) else {
            return false;
        };
        let mut inner = self.lock();
        match inner.workers.get_mut(id) {
            Some(meta) => {
                meta.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> WorkerStatus {
        self.lock().status(id.trim())
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Expulsa a los workers sin contacto hace más de `worker_timeout`.
    /// Sus comandos pendientes se pierden con ellos.
    pub fn sweep(&self, now: SystemTime) -> Vec<WorkerId> {
        let timeout = self.settings.worker_timeout;
        let mut inner = self.lock();

        let expired: Vec<WorkerId> = inner
            .workers
            .iter()
            .filter(|(_, meta)| match now.duration_since(meta.last_seen) {
                Ok(elapsed) => elapsed > timeout,
                // last_seen en el futuro? lo dejamos
                Err(_) => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.forget(id);
        }
        expired
    }

    /* ---------------- denylist ---------------- */

    /// Bloquea un id. Devuelve true si estaba registrado (y fue removido).
    pub fn block(&self, id: &str) -> Result<bool, CoordinatorError> {
        let id = require_id(id)?;
        let mut inner = self.lock();
        inner.blocked.insert(id.to_string());
        Ok(inner.forget(id))
    }

    /// Devuelve true si el id estaba bloqueado.
    pub fn unblock(&self, id: &str) -> Result<bool, CoordinatorError> {
        let id = require_id(id)?;
        Ok(self.lock().blocked.remove(id))
    }

    pub fn blocked(&self) -> Vec<WorkerId> {
        self.lock().blocked.iter().cloned().collect()
    }

    /* ---------------- cola de comandos ---------------- */

    fn validate_task(&self, task_type: &str, duration_secs: u64) -> Result<(), CoordinatorError> {
        if !self.settings.task_types.contains(task_type) {
            return Err(CoordinatorError::Validation(format!(
                "tipo de tarea desconocido: {task_type:?}"
            )));
        }
        if duration_secs == 0 || duration_secs > self.settings.max_duration_secs {
            return Err(CoordinatorError::Validation(format!(
                "duración fuera de rango (1..={}): {duration_secs}",
                self.settings.max_duration_secs
            )));
        }
        Ok(())
    }

    /// Deja un comando para el worker, pisando el que hubiera sin reclamar.
    pub fn enqueue(
        &self,
        id: &str,
        task_type: &str,
        resource: Option<String>,
        duration_secs: u64,
        now: SystemTime,
    ) -> Result<(), CoordinatorError> {
        let id = require_id(id)?;
        self.validate_task(task_type, duration_secs)?;

        let mut inner = self.lock();
        inner.require_registered(id)?;

        inner.pending.insert(
            id.to_string(),
            PendingCommand {
                task_type: task_type.to_string(),
                resource: resource.filter(|r| !r.trim().is_empty()),
                duration_secs,
                enqueued_at: DateTime::<Utc>::from(now),
            },
        );
        inner.stats.note_task_issued();
        Ok(())
    }

    pub fn pending_command(&self, id: &str) -> Option<PendingCommand> {
        self.lock().pending.get(id).cloned()
    }

    /// Lee y borra lo que haya para el worker. El stop tiene prioridad
    /// sobre un comando en cola.
    pub fn poll(&self, id: &str, now: SystemTime) -> Result<Command, CoordinatorError> {
        let id = require_id(id)?;
        let mut inner = self.lock();
        inner.require_registered(id)?;

        if let Some(meta) = inner.workers.get_mut(id) {
            meta.last_seen = now;
        }

        if inner.stops.remove(id) {
            return Ok(Command::Stop);
        }

        Ok(inner
            .pending
            .remove(id)
            .map(PendingCommand::into_command)
            .unwrap_or(Command::None))
    }

    /// Pide a un solo worker que pare; descarta su comando pendiente.
    pub fn stop_worker(&self, id: &str) -> Result<(), CoordinatorError> {
        let id = require_id(id)?;
        let mut inner = self.lock();
        inner.require_registered(id)?;

        inner.pending.remove(id);
        inner.stops.insert(id.to_string());
        inner.stats.note_stops(1);
        Ok(())
    }

    /// Marca a todos los registrados para stop y vacía la cola. Devuelve a
    /// cuántos workers se les dejó el stop.
    pub fn broadcast_stop(&self) -> usize {
        let mut inner = self.lock();
        inner.pending.clear();

        let ids: Vec<WorkerId> = inner.workers.keys().cloned().collect();
        let count = ids.len();
        inner.stops.extend(ids);
        inner.stats.note_stops(count);
        count
    }

    /* ---------------- reportes y stats ---------------- */

    pub fn report(
        &self,
        req: &common::ReportRequest,
        now: SystemTime,
    ) -> Result<(), CoordinatorError> {
        let id = require_id(&req.worker)?;
        if req.task.trim().is_empty() {
            return Err(CoordinatorError::Validation("falta el tipo de tarea".into()));
        }

        let mut inner = self.lock();
        inner.require_registered(id)?;

        if let Some(meta) = inner.workers.get_mut(id) {
            meta.last_seen = now;
            meta.tasks_completed = meta.tasks_completed.saturating_add(1);
            meta.units_reported = meta.units_reported.saturating_add(req.units);
            if req.cpu_percent.is_some() {
                meta.last_cpu_percent = req.cpu_percent;
            }
            if req.mem_bytes.is_some() {
                meta.last_mem_bytes = req.mem_bytes;
            }
        }

        inner.stats.record(
            now,
            req.units,
            req.task.trim(),
            req.resource.as_deref(),
            req.latency_ms,
        );
        Ok(())
    }

    /// Rollover de throughput por segundo y por minuto.
    pub fn tick_stats(&self, now: SystemTime) {
        self.lock().stats.tick(now);
    }

    pub fn stats(&self, now: SystemTime) -> StatsSnapshot {
        let inner = self.lock();
        let online_window = self.settings.online_window;

        let mut snap = inner.stats.snapshot();
        snap.workers_registered = inner.workers.len();
        snap.workers_online = inner
            .workers
            .values()
            .filter(|m| {
                now.duration_since(m.last_seen)
                    .map(|age| age < online_window)
                    .unwrap_or(true)
            })
            .count();
        snap.workers_blocked = inner.blocked.len();
        snap.uptime_secs = self.uptime(now).as_secs();
        snap.generated_at = Some(DateTime::<Utc>::from(now));
        snap
    }

    pub fn workers(&self, now: SystemTime) -> Vec<WorkerInfo> {
        let inner = self.lock();
        let online_window = self.settings.online_window;

        let mut out: Vec<WorkerInfo> = inner
            .workers
            .iter()
            .map(|(id, meta)| {
                let age = now.duration_since(meta.last_seen).unwrap_or_default();
                WorkerInfo {
                    worker_id: id.clone(),
                    registered_at: meta.registered_at,
                    last_seen_secs_ago: age.as_secs(),
                    online: age < online_window,
                    has_pending_command: inner.pending.contains_key(id),
                    stop_pending: inner.stops.contains(id),
                    tasks_completed: meta.tasks_completed,
                    units_reported: meta.units_reported,
                    cpu_percent: meta.last_cpu_percent,
                    mem_bytes: meta.last_mem_bytes,
                }
            })
            .collect();

        out.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.worker_id.cmp(&b.worker_id)));
        out
    }
}
