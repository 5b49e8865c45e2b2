use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Point-in-time view of monitor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatsSnapshot {
    /// Backend address being monitored
    pub backend_addr: String,
    /// Total number of accepted sessions
    pub total_sessions: u64,
    /// Currently active sessions
    pub active_sessions: u64,
    /// Sessions that produced a record
    pub completed_sessions: u64,
    /// Sessions that produced a failure
    pub failed_sessions: u64,
    /// Accept-time errors (excluding listener shutdown)
    pub accept_errors: u64,
    /// Total request bytes read from clients
    pub request_bytes: u64,
    /// Total response bytes read from backends
    pub response_bytes: u64,
    /// Timestamp when the monitor started (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker shared between the accept loop and its sessions
#[derive(Debug, Clone)]
pub struct MonitorStats {
    backend_addr: String,
    total_sessions: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
    completed_sessions: Arc<AtomicU64>,
    failed_sessions: Arc<AtomicU64>,
    accept_errors: Arc<AtomicU64>,
    request_bytes: Arc<AtomicU64>,
    response_bytes: Arc<AtomicU64>,
    start_time: u64,
}

impl MonitorStats {
    pub fn new(backend_addr: impl Into<String>) -> Self {
        Self {
            backend_addr: backend_addr.into(),
            total_sessions: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            completed_sessions: Arc::new(AtomicU64::new(0)),
            failed_sessions: Arc::new(AtomicU64::new(0)),
            accept_errors: Arc::new(AtomicU64::new(0)),
            request_bytes: Arc::new(AtomicU64::new(0)),
            response_bytes: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Count a new session; the returned guard marks it inactive on drop
    pub fn session_started(&self) -> SessionGuard {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: self.clone(),
        }
    }

    /// Record a completed session and its traffic
    pub fn session_completed(&self, request_bytes: u64, response_bytes: u64) {
        self.completed_sessions.fetch_add(1, Ordering::Relaxed);
        self.request_bytes
            .fetch_add(request_bytes, Ordering::Relaxed);
        self.response_bytes
            .fetch_add(response_bytes, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.failed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            backend_addr: self.backend_addr.clone(),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            completed_sessions: self.completed_sessions.load(Ordering::Relaxed),
            failed_sessions: self.failed_sessions.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            request_bytes: self.request_bytes.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

/// RAII guard to automatically decrement the active session count
pub struct SessionGuard {
    stats: MonitorStats,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}
