use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use super::Subresult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub th_address: String,
    pub sni: String,
}

impl CacheKey {
    pub fn new(th_address: &str, sni: &str) -> Self {
        Self {
            th_address: th_address.to_string(),
            sni: sni.to_string(),
        }
    }
}

/// Per-key singleflight cache of subresults.
///
/// Concurrent requests for one key wait for a single measurement; unrelated
/// keys never block each other. The stored value keeps `cached == false`,
/// every other caller gets a copy with `cached == true`.
#[derive(Debug, Default)]
pub struct SubresultCache {
    slots: Mutex<HashMap<CacheKey, Arc<OnceCell<Subresult>>>>,
}

impl SubresultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_measure<F, Fut>(&self, key: CacheKey, measure: F) -> Subresult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Subresult>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key).or_default().clone()
        };
        let built = AtomicBool::new(false);
        let built_ref = &built;
        let stored = slot
            .get_or_init(move || async move {
                built_ref.store(true, Ordering::Relaxed);
                measure().await
            })
            .await;
        let mut result = stored.clone();
        result.cached = !built.load(Ordering::Relaxed);
        result
    }

    /// Cached copy, if the key has completed.
    pub fn get(&self, key: &CacheKey) -> Option<Subresult> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = slots.get(key)?.get()?.clone();
        result.cached = true;
        Some(result)
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
