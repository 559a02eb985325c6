use chrono::{DateTime, Utc};
use common::{MinuteCount, StatsSnapshot};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ventana deslizante para el throughput actual.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);
/// Minutos cerrados que guardamos en el historial.
pub const MINUTE_HISTORY_LEN: usize = 60;
/// Peso del valor anterior en la media exponencial de latencia.
const LATENCY_DECAY: f64 = 0.9;

fn minute_index(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / 60
}

fn bump(counter: &mut u64, by: u64) {
    *counter = counter.saturating_add(by);
}

fn minute_start(index: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp((index * 60) as i64, 0).unwrap_or_default()
}

/// Contadores agregados a partir de los reportes de los workers.
///
/// No tiene lock propio: vive dentro del estado del coordinador y se muta
/// siempre bajo el mismo mutex que el registro y la cola.
#[derive(Debug)]
pub struct StatsAggregator {
    window: VecDeque<(SystemTime, u64)>,
    current_throughput: u64,
    peak_throughput: u64,

    current_minute: u64,
    minute_units: u64,
    units_last_minute: u64,
    peak_units_per_minute: u64,
    history: VecDeque<MinuteCount>,

    total_units: u64,
    total_reports: u64,
    tasks_issued: u64,
    stops_issued: u64,

    by_task_type: BTreeMap<String, u64>,
    by_resource: BTreeMap<String, u64>,
    mean_latency_ms: Option<f64>,
}

impl StatsAggregator {
    pub fn new(now: SystemTime) -> Self {
        Self {
            window: VecDeque::new(),
            current_throughput: 0,
            peak_throughput: 0,
            current_minute: minute_index(now),
            minute_units: 0,
            units_last_minute: 0,
            peak_units_per_minute: 0,
            history: VecDeque::with_capacity(MINUTE_HISTORY_LEN),
            total_units: 0,
            total_reports: 0,
            tasks_issued: 0,
            stops_issued: 0,
            by_task_type: BTreeMap::new(),
            by_resource: BTreeMap::new(),
            mean_latency_ms: None,
        }
    }

    /// Registra un reporte de un worker.
    pub fn record(
        &mut self,
        now: SystemTime,
        units: u64,
        task_type: &str,
        resource: Option<&str>,
        latency_ms: Option<f64>,
    ) {
        // si el timer todavía no cerró el minuto, lo cerramos acá para no
        // contar estas unidades en el minuto anterior
        self.roll_minute(now);

        // los contadores saturan en u64::MAX: nunca vuelven a cero
        self.window.push_back((now, units));
        bump(&mut self.minute_units, units);
        bump(&mut self.total_units, units);
        bump(&mut self.total_reports, 1);

        bump(self.by_task_type.entry(task_type.to_string()).or_insert(0), 1);
        if let Some(r) = resource.filter(|r| !r.is_empty()) {
            bump(self.by_resource.entry(r.to_string()).or_insert(0), 1);
        }

        if let Some(sample) = latency_ms.filter(|s| s.is_finite() && *s >= 0.0) {
            self.mean_latency_ms = Some(match self.mean_latency_ms {
                None => sample,
                Some(old) => old * LATENCY_DECAY + sample * (1.0 - LATENCY_DECAY),
            });
        }
    }

    pub fn note_task_issued(&mut self) {
        bump(&mut self.tasks_issued, 1);
    }

    pub fn note_stops(&mut self, workers: usize) {
        bump(&mut self.stops_issued, workers as u64);
    }

    /// Recalcula el throughput del último segundo y cierra el minuto si
    /// cambió. Lo llama el timer de 1s.
    pub fn tick(&mut self, now: SystemTime) {
        while let Some(&(ts, _)) = self.window.front() {
            match now.duration_since(ts) {
                Ok(age) if age >= THROUGHPUT_WINDOW => {
                    self.window.pop_front();
                }
                // reportes "del futuro" (reloj movido) se quedan hasta que venzan
                _ => break,
            }
        }

        self.current_throughput = self
            .window
            .iter()
            .fold(0u64, |acc, (_, u)| acc.saturating_add(*u));
        self.peak_throughput = self.peak_throughput.max(self.current_throughput);

        self.roll_minute(now);
    }

    fn roll_minute(&mut self, now: SystemTime) {
        let minute = minute_index(now);
        if minute == self.current_minute {
            return;
        }

        self.units_last_minute = self.minute_units;
        self.peak_units_per_minute = self.peak_units_per_minute.max(self.minute_units);

        self.history.push_back(MinuteCount {
            minute: minute_start(self.current_minute),
            units: self.minute_units,
        });
        while self.history.len() > MINUTE_HISTORY_LEN {
            self.history.pop_front();
        }

        self.minute_units = 0;
        self.current_minute = minute;
    }

    /// Copia de los contadores. Los campos de workers y uptime los completa
    /// el coordinador.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            current_throughput: self.current_throughput,
            peak_throughput: self.peak_throughput,
            units_last_minute: self.units_last_minute,
            peak_units_per_minute: self.peak_units_per_minute,
            minute_history: self.history.iter().cloned().collect(),
            total_units: self.total_units,
            total_reports: self.total_reports,
            tasks_issued: self.tasks_issued,
            stops_issued: self.stops_issued,
            by_task_type: self.by_task_type.clone(),
            by_resource: self.by_resource.clone(),
            mean_latency_ms: self.mean_latency_ms,
            ..StatsSnapshot::default()
        }
    }
}
