// Connection admission control.
//
// All counters live behind a single lock so an admission decision and the
// writes it implies are one atomic step. Checks run in a fixed order and the
// first failure wins without touching any counter.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::HeaderMap;
use nextdesk_common::protocol::CloseReason;
use tokio::time::Instant;
use tracing::warn;

use crate::config::Limits;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Default)]
struct IpCounters {
    active: usize,
    recent: VecDeque<Instant>,
}

impl IpCounters {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) > RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.recent.is_empty()
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    global: usize,
    ips: HashMap<String, IpCounters>,
}

pub struct AdmissionGuard {
    limits: Limits,
    state: Mutex<AdmissionState>,
}

impl AdmissionGuard {
    pub fn new(limits: Limits) -> Self {
        Self { limits, state: Mutex::new(AdmissionState::default()) }
    }

    /// Decide whether a new connection from `ip` may proceed.
    ///
    /// The candidate itself counts toward the global total. On success the
    /// connection-rate timestamp is recorded and the global and per-IP slots
    /// are taken in the same critical section. The returned
    /// [`ConnectionPermit`] holds both slots.
    pub fn admit(self: &Arc<Self>, ip: &str, memory_ratio: f64) -> Result<ConnectionPermit, CloseReason> {
        self.admit_at(ip, memory_ratio, Instant::now())
    }

    pub fn admit_at(
        self: &Arc<Self>,
        ip: &str,
        memory_ratio: f64,
        now: Instant,
    ) -> Result<ConnectionPermit, CloseReason> {
        let mut state = self.state.lock().expect("admission lock poisoned");

        let candidate_global = state.global + 1;
        if candidate_global > self.limits.max_global_conns {
            warn!(
                ip,
                current = candidate_global,
                max = self.limits.max_global_conns,
                "connection rejected: global connection limit reached"
            );
            return Err(CloseReason::ServerBusy);
        }

        if memory_ratio > self.limits.memory_threshold {
            warn!(
                ip,
                memory_ratio,
                threshold = self.limits.memory_threshold,
                "connection rejected: memory threshold exceeded"
            );
            return Err(CloseReason::ServerBusy);
        }

        let active = state.ips.get(ip).map_or(0, |counters| counters.active);
        if active >= self.limits.max_conns_per_ip {
            warn!(
                ip,
                current = active,
                max = self.limits.max_conns_per_ip,
                "connection rejected: per-ip connection limit reached"
            );
            return Err(CloseReason::TooManyConnections);
        }

        let counters = state.ips.entry(ip.to_owned()).or_default();
        counters.prune(now);
        if counters.recent.len() >= self.limits.max_conn_rate_per_min {
            warn!(
                ip,
                rate = counters.recent.len(),
                max = self.limits.max_conn_rate_per_min,
                "connection rejected: per-ip connection rate limit exceeded"
            );
            return Err(CloseReason::ConnectionRateLimited);
        }

        counters.recent.push_back(now);
        counters.active += 1;
        state.global = candidate_global;

        Ok(ConnectionPermit { guard: Arc::clone(self), ip: ip.to_owned() })
    }

    pub fn global_connections(&self) -> usize {
        self.state.lock().expect("admission lock poisoned").global
    }

    pub fn active_for_ip(&self, ip: &str) -> usize {
        let state = self.state.lock().expect("admission lock poisoned");
        state.ips.get(ip).map_or(0, |counters| counters.active)
    }

    /// Forget IPs with no open connections and no timestamps left in the
    /// rate window. Returns how many entries were dropped.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let mut state = self.state.lock().expect("admission lock poisoned");
        let before = state.ips.len();
        state.ips.retain(|_, counters| {
            counters.prune(now);
            !counters.is_idle()
        });
        before - state.ips.len()
    }

    fn release(&self, ip: &str) {
        let mut state = self.state.lock().expect("admission lock poisoned");
        state.global = state.global.saturating_sub(1);
        if let Some(counters) = state.ips.get_mut(ip) {
            counters.active = counters.active.saturating_sub(1);
        }
    }
}

/// Slots held by one admitted connection. Dropping the permit releases them;
/// rate-window timestamps are kept.
pub struct ConnectionPermit {
    guard: Arc<AdmissionGuard>,
    ip: String,
}

impl ConnectionPermit {
    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.guard.release(&self.ip);
    }
}

/// Client address used for limiting: first `X-Forwarded-For` hop, else the
/// peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, peer) {
        (Some(first_hop), _) => first_hop.to_owned(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => UNKNOWN_IP.to_owned(),
    }
}
