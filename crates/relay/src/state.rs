use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::admission::AdmissionGuard;
use crate::config::{Limits, RelayConfig};
use crate::memory::MemoryProbe;
use crate::room::{reaper, RoomDirectory, SessionId};
use crate::shutdown::Shutdown;

/// Everything a connection or probe handler needs, shared across tasks.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    limits: Limits,
    admission: Arc<AdmissionGuard>,
    memory: Arc<dyn MemoryProbe>,
    rooms: Arc<RoomDirectory>,
    shutdown: Shutdown,
    next_session_id: AtomicU64,
    started_at: Instant,
}

impl RelayState {
    pub fn new(config: &RelayConfig, memory: Arc<dyn MemoryProbe>, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(RelayStateInner {
                limits: config.limits.clone(),
                admission: Arc::new(AdmissionGuard::new(config.limits.clone())),
                memory,
                rooms: Arc::new(RoomDirectory::new(config.room_inactive_timeout)),
                shutdown,
                next_session_id: AtomicU64::new(1),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    pub fn admission(&self) -> &Arc<AdmissionGuard> {
        &self.inner.admission
    }

    pub fn memory_ratio(&self) -> f64 {
        self.inner.memory.usage_ratio()
    }

    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.inner.rooms
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    pub fn next_session_id(&self) -> SessionId {
        self.inner.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        reaper::spawn(
            Arc::clone(&self.inner.rooms),
            Arc::clone(&self.inner.admission),
            every,
            self.inner.shutdown.subscribe(),
        )
    }
}
