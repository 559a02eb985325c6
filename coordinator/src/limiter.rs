use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Buckets inactivos más allá de esto se descartan en la próxima limpieza.
const IDLE_BUCKET_TTL: Duration = Duration::from_secs(3600);
const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Ráfaga máxima (tokens del bucket)
    pub capacity: u32,
    /// Tiempo en que se recarga el bucket completo
    pub window: Duration,
}

impl RateLimiterConfig {
    fn refill_per_sec(&self) -> f64 {
        f64::from(self.capacity) / self.window.as_secs_f64().max(1e-3)
    }
}

impl Default for RateLimiterConfig {
    // 100 requests cada 15 minutos por cliente
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket por cliente para los endpoints protegidos.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume un token para `client`. Si no hay, devuelve cuánto esperar.
    pub fn try_acquire(&self, client: &str, now: Instant) -> Result<(), Duration> {
        let capacity = f64::from(self.config.capacity);
        let refill = self.config.refill_per_sec();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(client) {
            buckets.retain(|_, b| now.saturating_duration_since(b.last_update) < IDLE_BUCKET_TTL);
        }

        let bucket = buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        let available = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_update = now;

        if available >= 1.0 {
            bucket.tokens = available - 1.0;
            Ok(())
        } else {
            bucket.tokens = available;
            let wait = (1.0 - available) / refill;
            Err(Duration::from_secs_f64(wait))
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
