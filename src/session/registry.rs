//! Process-wide session table.
//!
//! Every connection (WebSocket or WebRTC) owns a [`SessionGuard`]. The guard's
//! drop is the only place an entry leaves the table, so cleanup happens exactly
//! once no matter which path ended the session.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Messages,
    Track,
}

#[derive(Debug)]
struct Entry {
    peer: String,
    transport: TransportKind,
    authenticated: bool,
    streaming: bool,
}

#[derive(Debug, Error)]
#[error("session limit reached ({0} active)")]
pub struct CapacityError(pub usize);

/// Counts reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryCounts {
    pub sessions: usize,
    pub authenticated: usize,
    pub streams: usize,
}

#[derive(Clone)]
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<SessionId, Entry>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Admit a new connection, or refuse when the table is full
    pub fn register(&self, peer: String, transport: TransportKind) -> Result<SessionGuard, CapacityError> {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_sessions {
            return Err(CapacityError(entries.len()));
        }

        let mut id = generate_session_id();
        while entries.contains_key(&id) {
            id = generate_session_id();
        }
        entries.insert(
            id.clone(),
            Entry {
                peer,
                transport,
                authenticated: false,
                streaming: false,
            },
        );

        Ok(SessionGuard {
            id,
            registry: self.clone(),
        })
    }

    pub fn set_authenticated(&self, id: &str, authenticated: bool) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.authenticated = authenticated;
        }
    }

    pub fn set_streaming(&self, id: &str, streaming: bool) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.streaming = streaming;
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn counts(&self) -> RegistryCounts {
        let entries = self.entries.read();
        RegistryCounts {
            sessions: entries.len(),
            authenticated: entries.values().filter(|e| e.authenticated).count(),
            streams: entries.values().filter(|e| e.streaming).count(),
        }
    }

    /// (peer, transport) for every live session
    pub fn peers(&self) -> Vec<(String, TransportKind)> {
        self.entries
            .read()
            .values()
            .map(|e| (e.peer.clone(), e.transport))
            .collect()
    }

    fn remove(&self, id: &str) {
        self.entries.write().remove(id);
    }
}

/// Membership in the registry. Removes the entry when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    registry: SessionRegistry,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.registry.set_authenticated(&self.id, authenticated);
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.registry.set_streaming(&self.id, streaming);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("counts", &self.counts())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let random_bytes: Vec<u8> = (0..8).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(random_bytes)
}
