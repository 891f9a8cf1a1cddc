use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use super::state::Session;

/// Concurrency-safe map from stream URL to its session.
///
/// Sessions are handed out as `Arc<Session>` so callers never hold the map
/// lock while they work on a session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    /// Return the session for `url`, creating it on first use.
    pub fn get_or_create(&self, url: &str, now: Instant) -> Arc<Session> {
        if let Some(session) = self.get(url) {
            return session;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(url.to_string()).or_insert_with(|| {
            log::debug!("SessionRegistry: created session for {}", url);
            Arc::new(Session::new(url, now))
        }))
    }

    pub fn remove(&self, url: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url)
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let first = registry.get_or_create("fake://a", now);
        let second = registry.get_or_create("fake://a", now);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("fake://b").is_none());
    }

    #[test]
    fn concurrent_creation_yields_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let now = Instant::now();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get_or_create("fake://shared", now))
            })
            .collect();
        let sessions: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_and_drain_empty_the_map() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        registry.get_or_create("fake://a", now);
        registry.get_or_create("fake://b", now);
        assert!(registry.remove("fake://a").is_some());
        assert!(registry.remove("fake://a").is_none());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
