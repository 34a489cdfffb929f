//! Cache de resultados: guarda el artefacto de cada tarea completada y
//! mantiene el total bajo un presupuesto de bytes, expulsando primero las
//! entradas leídas hace más tiempo.

use common::{ResultRef, Table, TaskId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("ya hay un resultado guardado para {0}")]
    AlreadyStored(TaskId),

    #[error("no hay resultado para {0}")]
    NotFound(TaskId),

    #[error("el resultado de {0} todavía no fue leído")]
    NotFetched(TaskId),
}

struct CacheEntry {
    artifact: Arc<Table>,
    bytes: u64,
    // reloj lógico del último acceso (el alta cuenta como acceso)
    last_access: u64,
    fetched: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<TaskId, CacheEntry>,
    total_bytes: u64,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.bytes);
        Some(entry)
    }
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
}

impl ResultCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Guarda el artefacto de una tarea. Una sola vez por id.
    pub fn put(&self, id: &str, artifact: Table, bytes: u64) -> Result<ResultRef, CacheError> {
        let mut inner = self.lock();

        if inner.entries.contains_key(id) {
            return Err(CacheError::AlreadyStored(id.to_string()));
        }

        let rows = artifact.len();
        let last_access = inner.tick();
        inner.entries.insert(
            id.to_string(),
            CacheEntry {
                artifact: Arc::new(artifact),
                bytes,
                last_access,
                fetched: false,
            },
        );
        inner.total_bytes += bytes;

        self.enforce_budget(&mut inner, id);

        Ok(ResultRef {
            key: id.to_string(),
            rows,
            bytes,
        })
    }

    /// Expulsa por LRU hasta entrar en el presupuesto. La entrada recién
    /// guardada (`keep`) no se expulsa en su propio alta.
    fn enforce_budget(&self, inner: &mut CacheInner, keep: &str) {
        while inner.total_bytes > self.max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());

            let Some(victim) = victim else {
                break;
            };

            if let Some(e) = inner.remove(&victim) {
                info!(
                    "cache: expulsando resultado de {} ({} bytes) por presupuesto de {} bytes",
                    victim, e.bytes, self.max_bytes
                );
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Table>, CacheError> {
        let mut inner = self.lock();
        let now = inner.tick();

        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        entry.last_access = now;
        entry.fetched = true;
        Ok(entry.artifact.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn evict(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            debug!("cache: resultado de {} expulsado", id);
        }
        removed
    }

    /// El cliente confirma que ya tiene el resultado: se libera.
    pub fn acknowledge(&self, id: &str) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let fetched = inner.entries.get(id).map(|e| e.fetched);
        match fetched {
            None => Err(CacheError::NotFound(id.to_string())),
            Some(false) => Err(CacheError::NotFetched(id.to_string())),
            Some(true) => {
                inner.remove(id);
                debug!("cache: resultado de {} liberado tras confirmación", id);
                Ok(())
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(n: usize) -> Table {
        Table::from_records((0..n).map(|i| json!({ "i": i })).collect())
    }

    #[test]
    fn put_es_de_una_sola_vez() {
        let cache = ResultCache::new(1_000);
        let r = cache.put("t1", table(2), 10).unwrap();
        assert_eq!(r.rows, 2);
        assert_eq!(r.bytes, 10);

        assert_eq!(
            cache.put("t1", table(1), 5),
            Err(CacheError::AlreadyStored("t1".into()))
        );
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn get_devuelve_el_mismo_artefacto_hasta_expulsarlo() {
        let cache = ResultCache::new(1_000);
        cache.put("t1", table(3), 10).unwrap();

        let a = cache.get("t1").unwrap();
        let b = cache.get("t1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 3);

        assert!(cache.evict("t1"));
        assert_eq!(cache.get("t1").unwrap_err(), CacheError::NotFound("t1".into()));
        assert!(!cache.evict("t1"));
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn expulsa_el_menos_leido_al_pasar_el_presupuesto() {
        let cache = ResultCache::new(100);
        cache.put("a", table(1), 40).unwrap();
        cache.put("b", table(1), 40).unwrap();

        // leer "a" lo vuelve el más reciente; "b" queda como víctima
        cache.get("a").unwrap();
        cache.put("c", table(1), 40).unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.total_bytes(), 80);
    }

    #[test]
    fn artefacto_mas_grande_que_el_presupuesto_sigue_disponible() {
        let cache = ResultCache::new(50);
        cache.put("chico", table(1), 10).unwrap();
        cache.put("grande", table(5), 500).unwrap();

        assert!(!cache.contains("chico"));
        assert!(cache.get("grande").is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn acknowledge_requiere_lectura_previa() {
        let cache = ResultCache::new(1_000);
        cache.put("t1", table(1), 10).unwrap();

        assert_eq!(
            cache.acknowledge("t1"),
            Err(CacheError::NotFetched("t1".into()))
        );

        cache.get("t1").unwrap();
        cache.acknowledge("t1").unwrap();
        assert!(cache.is_empty());
        assert_eq!(
            cache.acknowledge("t1"),
            Err(CacheError::NotFound("t1".into()))
        );
    }
}
