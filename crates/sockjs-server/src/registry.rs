use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::session::{Session, CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON};

/// Concurrency-safe store of session-id → session. Owned by the server and
/// injected into every handler; never a process-wide singleton.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    max_inbound_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_inbound_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_inbound_queue,
        }
    }

    /// Look up an existing session. Send-class requests use this; an unknown
    /// id is the caller's 404.
    pub fn resolve(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up or atomically create. Connect-class requests use this; the
    /// entry API guarantees concurrent creators on one id yield exactly one
    /// session. The bool reports whether this call created it.
    pub fn resolve_or_create(&self, id: &str) -> (Arc<Session>, bool) {
        let mut created = false;
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                created = true;
                Session::new(id, self.max_inbound_queue)
            })
            .clone();
        if created {
            tracing::debug!(session_id = %id, "Session created");
        }
        (session, created)
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close and remove every session with no attached receiver that has
    /// been idle past `timeout`. Bounds memory growth from abandoned clients
    /// and retires delivered-close sessions.
    pub fn sweep(&self, timeout: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|entry| match entry.value().idle_for() {
                Some(idle) if idle >= timeout => Some(entry.key().clone()),
                _ => None,
            })
            .collect();

        let mut removed = 0;
        for id in expired {
            // Re-check under the shard lock: a receiver may have attached
            // between the scan and the removal, and an attached session must
            // never be evicted out from under its transport.
            let evicted = self.sessions.remove_if(&id, |_, session| {
                matches!(session.idle_for(), Some(idle) if idle >= timeout)
            });
            if let Some((_, session)) = evicted {
                session.close(CLOSE_INTERRUPTED, CLOSE_INTERRUPTED_REASON);
                removed += 1;
                tracing::info!(session_id = %id, "Evicted idle session");
            }
        }
        removed
    }
}

/// Background task that periodically evicts idle sessions.
pub fn start_sweep_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            let removed = registry.sweep(timeout);
            if removed > 0 {
                tracing::debug!(removed = removed, "Idle session sweep");
            }
        }
    })
}
