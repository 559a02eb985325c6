use crate::state::AppState;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Barrido de heartbeats: expulsa a los workers que dejaron de hacer poll.
pub async fn monitor_workers(state: AppState, every: Duration) {
    loop {
        tokio::time::sleep(every).await;

        let evicted = state.coordinator.sweep(SystemTime::now());
        for id in &evicted {
            info!("expulsando worker {} (sin contacto)", id);
        }
        if !evicted.is_empty() {
            debug!(
                "quedan {} workers registrados",
                state.coordinator.worker_count()
            );
        }
    }
}

/// Rollover de las stats por segundo y por minuto.
pub async fn roll_stats(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        state.coordinator.tick_stats(SystemTime::now());
    }
}
