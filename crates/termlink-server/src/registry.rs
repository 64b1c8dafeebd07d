//! Session registry: id → running PTY host.
//!
//! Pure bookkeeping. The registry holds a lookup table of hosts and the set
//! of ids it has ever issued, so an evicted id can never be registered again.
//! Connection handling receives the registry as an `Arc<dyn SessionRegistry>`.

use crate::session::PtyHost;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use termlink_core::{BridgeError, BridgeResult, SessionId};
use tracing::{debug, info};

/// Lookup table of live sessions.
pub trait SessionRegistry: Send + Sync {
    /// Add a host under its id. Fails if the id was ever registered before.
    fn register(&self, host: Arc<PtyHost>) -> BridgeResult<()>;

    fn lookup(&self, id: &SessionId) -> Option<Arc<PtyHost>>;

    /// Remove a host. Its id stays retired.
    fn evict(&self, id: &SessionId) -> Option<Arc<PtyHost>>;

    /// Number of live sessions.
    fn len(&self) -> usize;

    /// All live hosts (for shutdown).
    fn snapshot(&self) -> Vec<Arc<PtyHost>>;
}

#[derive(Default)]
struct Table {
    live: HashMap<SessionId, Arc<PtyHost>>,
    issued: HashSet<SessionId>,
}

/// The process-wide registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    table: RwLock<Table>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn register(&self, host: Arc<PtyHost>) -> BridgeResult<()> {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        let id = host.id().clone();
        if !table.issued.insert(id.clone()) {
            return Err(BridgeError::AlreadyRegistered(id.to_string()));
        }
        table.live.insert(id.clone(), host);
        debug!(session_id = %id.short(), live = table.live.len(), "session registered");
        Ok(())
    }

    fn lookup(&self, id: &SessionId) -> Option<Arc<PtyHost>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.live.get(id).cloned()
    }

    fn evict(&self, id: &SessionId) -> Option<Arc<PtyHost>> {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        let removed = table.live.remove(id);
        if removed.is_some() {
            info!(session_id = %id.short(), live = table.live.len(), "session evicted");
        }
        removed
    }

    fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.live.len()
    }

    fn snapshot(&self) -> Vec<Arc<PtyHost>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.live.values().cloned().collect()
    }
}
