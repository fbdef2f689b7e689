//! Session Registry
//!
//! Tracks live sessions for introspection and shutdown. The registry only
//! holds each session's [`SessionControl`]; the sockets stay with the task
//! running the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::relay::{SessionControl, SessionState};

/// Point-in-time view of one live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: Option<SocketAddr>,
    pub state: SessionState,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

/// Live sessions keyed by session id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionControl>>>,
    total_accepted: AtomicU64,
}

/// Removes its session from the registry when dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionControl>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a session until the returned guard is dropped
    pub fn register(self: &Arc<Self>, control: Arc<SessionControl>) -> SessionGuard {
        let session_id = control.session_id.clone();
        self.sessions().insert(session_id.clone(), control);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);

        SessionGuard {
            registry: Arc::clone(self),
            session_id,
        }
    }

    fn remove(&self, session_id: &str) {
        if self.sessions().remove(session_id).is_some() {
            debug!("Removed session {} from active tracking", session_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Sessions registered since startup
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions()
            .values()
            .map(|c| SessionInfo {
                session_id: c.session_id.clone(),
                client_addr: c.client_addr,
                target_addr: c.target_addr(),
                state: c.state(),
                bytes_up: c.bytes_up(),
                bytes_down: c.bytes_down(),
                duration: c.duration(),
            })
            .collect()
    }

    /// Close every live session; returns how many were newly closed
    pub fn close_all(&self) -> usize {
        let controls: Vec<_> = self.sessions().values().cloned().collect();
        controls.iter().filter(|c| c.close()).count()
    }

    /// Wait until no sessions remain or `timeout` elapses
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while self.active_count() > 0 {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        true
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id);
    }
}
