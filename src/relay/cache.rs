use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{ProxyResponseEnvelope, RequestId};

struct CacheEntry {
    response: ProxyResponseEnvelope,
    stored_at: Instant,
}

/// Time-bounded map from request id to the response already sent for it.
///
/// Expired entries are dropped on lookup and swept on insert. The whole cache
/// is cleared when the owning control link drops.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<RequestId, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, request_id: &RequestId) -> Option<ProxyResponseEnvelope> {
        let mut entries = self.lock();
        match entries.get(request_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(request_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, request_id: RequestId, response: ProxyResponseEnvelope) {
        let ttl = self.ttl;
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        entries.insert(
            request_id,
            CacheEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CacheEntry>> {
        // The map holds plain data, so a poisoned lock is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
