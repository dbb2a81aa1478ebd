use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::protocol::ServerEvent;

/// Tracks which users are currently online. The server pushes full roster
/// snapshots; each push replaces the previous set wholesale, nothing is
/// inferred locally. Stale snapshots only delay visibility, they never
/// corrupt it.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    online: Arc<Mutex<HashSet<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            online: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start consuming roster snapshots once the connection reports connected.
    /// The task dies with the event channel; no retry logic of its own.
    pub fn attach(&self, handle: ConnectionHandle) -> tokio::task::JoinHandle<()> {
        let online = self.online.clone();
        tokio::spawn(async move {
            let mut state = handle.state_changes();
            while *state.borrow() != ConnectionState::Connected {
                if state.changed().await.is_err() {
                    return;
                }
            }
            let mut events = handle.subscribe_events();
            loop {
                match events.recv().await {
                    Ok(ServerEvent::UpdateOnlineUsers(user_ids)) => {
                        let snapshot: HashSet<String> = user_ids.into_iter().collect();
                        info!("[PRESENCE] Roster snapshot: {} users online", snapshot.len());
                        *online.lock().await = snapshot;
                    }
                    Ok(_) => {}
                    // Snapshots replace each other wholesale, so skipped ones
                    // are harmless; keep reading for the next.
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[PRESENCE] Event feed lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.online.lock().await.contains(user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.online.lock().await.len()
    }

    /// Test/ingest seam: apply one snapshot directly.
    pub async fn apply_snapshot(&self, user_ids: Vec<String>) {
        *self.online.lock().await = user_ids.into_iter().collect();
    }
}
