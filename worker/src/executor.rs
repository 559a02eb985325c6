//! Ejecución local de tareas.
//!
//! El worker nunca interpreta el comando por su cuenta: busca un
//! `TaskExecutor` por nombre de tarea y le delega el trabajo. Todos los
//! ejecutores incluidos trabajan solo con recursos locales.

use anyhow::{bail, Result};
use common::TaskSpec;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bandera de cancelación cooperativa compartida entre el loop de poll y la
/// tarea en ejecución.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub units: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

pub trait TaskExecutor: Send + Sync {
    /// Corre la tarea hasta terminar o hasta que `cancel` se active.
    /// Se llama desde un hilo de bloqueo.
    fn execute(&self, task: &TaskSpec, cancel: &CancelFlag) -> Result<TaskOutcome>;
}

/// No hace nada; sirve para probar el circuito completo.
pub struct Noop;

impl TaskExecutor for Noop {
    fn execute(&self, _task: &TaskSpec, _cancel: &CancelFlag) -> Result<TaskOutcome> {
        Ok(TaskOutcome {
            units: 1,
            elapsed: Duration::ZERO,
            cancelled: false,
        })
    }
}

/// Espera `duration_secs` en rebanadas, revisando la cancelación entre cada una.
pub struct Sleep {
    slice: Duration,
}

impl Sleep {
    pub fn new(slice: Duration) -> Self {
        Self { slice }
    }
}

impl Default for Sleep {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl TaskExecutor for Sleep {
    fn execute(&self, task: &TaskSpec, cancel: &CancelFlag) -> Result<TaskOutcome> {
        let total = Duration::from_secs(task.duration_secs);
        let start = Instant::now();

        let cancelled = loop {
            if cancel.is_cancelled() {
                break true;
            }
            let elapsed = start.elapsed();
            if elapsed >= total {
                break false;
            }
            std::thread::sleep(self.slice.min(total - elapsed));
        };

        let elapsed = start.elapsed();
        Ok(TaskOutcome {
            units: elapsed.as_secs().min(task.duration_secs),
            elapsed,
            cancelled,
        })
    }
}

/// Trabajo de CPU: encadena hashes sobre la etiqueta `resource` durante
/// `duration_secs`. Cada unidad es una ronda de `rounds_per_unit` hashes.
pub struct Checksum {
    rounds_per_unit: u32,
}

impl Default for Checksum {
    fn default() -> Self {
        Self {
            rounds_per_unit: 10_000,
        }
    }
}

impl TaskExecutor for Checksum {
    fn execute(&self, task: &TaskSpec, cancel: &CancelFlag) -> Result<TaskOutcome> {
        let label = task.resource.as_deref().unwrap_or(&task.task);
        let total = Duration::from_secs(task.duration_secs);
        let start = Instant::now();

        let mut digest: u64 = 0;
        let mut units = 0u64;
        let cancelled = loop {
            if cancel.is_cancelled() {
                break true;
            }
            if start.elapsed() >= total {
                break false;
            }
            for _ in 0..self.rounds_per_unit {
                let mut h = DefaultHasher::new();
                digest.hash(&mut h);
                label.hash(&mut h);
                digest = h.finish();
            }
            units += 1;
        };

        tracing::debug!("checksum de {:?}: {:016x} tras {} rondas", label, digest, units);
        Ok(TaskOutcome {
            units,
            elapsed: start.elapsed(),
            cancelled,
        })
    }
}

/// Tabla nombre de tarea -> ejecutor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn with_builtins() -> Self {
        let mut reg = Self::default();
        reg.register("noop", Noop);
        reg.register("sleep", Sleep::default());
        reg.register("checksum", Checksum::default());
        reg
    }

    pub fn register(&mut self, name: &str, executor: impl TaskExecutor + 'static) {
        self.executors.insert(name.to_string(), Arc::new(executor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn run(&self, task: &TaskSpec, cancel: &CancelFlag) -> Result<TaskOutcome> {
        match self.executors.get(&task.task) {
            Some(exec) => exec.execute(task, cancel),
            None => bail!("no hay ejecutor para la tarea {:?}", task.task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spec(task: &str, duration_secs: u64) -> TaskSpec {
        TaskSpec {
            task: task.to_string(),
            resource: Some("batch-1".to_string()),
            duration_secs,
        }
    }

    #[test]
    fn builtins_are_registered() {
        let reg = ExecutorRegistry::with_builtins();
        assert_eq!(reg.names(), vec!["checksum", "noop", "sleep"]);
    }

    #[test]
    fn unknown_task_is_an_error() {
        let reg = ExecutorRegistry::with_builtins();
        let err = reg.run(&spec("mystery", 1), &CancelFlag::new()).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn noop_reports_one_unit() {
        let reg = ExecutorRegistry::with_builtins();
        let out = reg.run(&spec("noop", 5), &CancelFlag::new()).unwrap();
        assert_eq!(out.units, 1);
        assert!(!out.cancelled);
    }

    #[test]
    fn sleep_runs_for_its_duration() {
        let out = Sleep::new(Duration::from_millis(50))
            .execute(&spec("sleep", 1), &CancelFlag::new())
            .unwrap();
        assert!(!out.cancelled);
        assert!(out.elapsed >= Duration::from_secs(1));
        assert_eq!(out.units, 1);
    }

    #[test]
    fn sleep_stops_when_cancelled() {
        let cancel = CancelFlag::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            Sleep::new(Duration::from_millis(10)).execute(&spec("sleep", 30), &cancel)
        });

        thread::sleep(Duration::from_millis(100));
        remote.cancel();

        let out = handle.join().unwrap().unwrap();
        assert!(out.cancelled);
        assert!(out.elapsed < Duration::from_secs(5));
        assert_eq!(out.units, 0);
    }

    #[test]
    fn checksum_does_work_until_cancelled() {
        let cancel = CancelFlag::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            Checksum { rounds_per_unit: 100 }.execute(&spec("checksum", 30), &cancel)
        });

        thread::sleep(Duration::from_millis(50));
        remote.cancel();

        let out = handle.join().unwrap().unwrap();
        assert!(out.cancelled);
        assert!(out.units > 0);
    }

    #[test]
    fn cancelled_before_start_does_nothing() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let out = Checksum::default().execute(&spec("checksum", 10), &cancel).unwrap();
        assert!(out.cancelled);
        assert_eq!(out.units, 0);
    }

    #[test]
    fn cancel_flags_compare_by_identity() {
        let a = CancelFlag::new();
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&CancelFlag::new()));
    }
}
