use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::registry::TaskRegistry;

/// Loop de limpieza: cada `interval` borra las tareas terminadas hace más
/// de `ttl`. Los artefactos en cache siguen su propia política.
pub async fn run_ttl_sweeper(registry: Arc<TaskRegistry>, ttl: Duration, interval: Duration) {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        warn!("TTL {:?} fuera de rango, no se limpian tareas", ttl);
        return;
    };

    loop {
        sleep(interval).await;

        let removed = sweep_once(&registry, ttl, Utc::now());
        if removed > 0 {
            info!("limpieza: {} tareas vencidas borradas", removed);
        }
    }
}

/// Una pasada. Devuelve cuántas tareas borró.
pub fn sweep_once(registry: &TaskRegistry, ttl: chrono::Duration, now: DateTime<Utc>) -> usize {
    let mut removed = 0;

    for id in registry.expired(now, ttl) {
        if registry.remove(&id).is_some() {
            debug!("tarea {} vencida", id);
            removed += 1;
        }
    }

    removed
}
