//! Engine metrics, fed purely by the event bus.
//!
//! The collector is an observer: it subscribes like any other consumer and
//! never calls back into the registry or stream manager. If it lags on the
//! bus, the missed events are counted and the gauges may drift slightly;
//! the data path is unaffected.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

use crate::events::{EventBus, SessionEvent};
use crate::registry::SessionRegistry;

/// How often tracked processes are sampled for the resource gauges.
const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Kernel USER_HZ; /proc cpu times are reported in these ticks.
const CLOCK_TICKS_PER_SEC: u64 = 100;

#[derive(Debug)]
pub struct EngineMetrics {
    // Session lifecycle
    pub active_sessions: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub processes_exited: AtomicU64,

    // Focus and streaming
    pub focus_changes: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub chunks_dropped: AtomicU64,

    // Connections
    pub live_connections: AtomicU64,
    pub connections_attached: AtomicU64,
    pub connections_detached: AtomicU64,

    // Resilience
    pub circuit_transitions: AtomicU64,

    // Resource gauges, refreshed by the sampler task.
    pub process_rss_bytes: AtomicU64,
    pub process_cpu_ticks: AtomicU64,

    /// Events this collector itself missed while lagging on the bus.
    pub events_dropped: AtomicU64,

    start_time: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            processes_exited: AtomicU64::new(0),
            focus_changes: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            live_connections: AtomicU64::new(0),
            connections_attached: AtomicU64::new(0),
            connections_detached: AtomicU64::new(0),
            circuit_transitions: AtomicU64::new(0),
            process_rss_bytes: AtomicU64::new(0),
            process_cpu_ticks: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn observe(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Created { .. } => {
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
                self.active_sessions.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::Closed { .. } => {
                self.sessions_closed.fetch_add(1, Ordering::Relaxed);
                // Saturating: a lagged collector may see Closed without
                // having seen the matching Created.
                let _ = self.active_sessions.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |v| v.checked_sub(1),
                );
            }
            SessionEvent::ProcessExited { .. } => {
                self.processes_exited.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::FocusChanged { .. } => {
                self.focus_changes.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::BufferOverflow { dropped_chunks, .. } => {
                self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                self.chunks_dropped
                    .fetch_add(*dropped_chunks, Ordering::Relaxed);
            }
            SessionEvent::ConnectionAttached { .. } => {
                self.connections_attached.fetch_add(1, Ordering::Relaxed);
                self.live_connections.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::ConnectionDetached { .. } => {
                self.connections_detached.fetch_add(1, Ordering::Relaxed);
                let _ = self.live_connections.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |v| v.checked_sub(1),
                );
            }
            SessionEvent::CircuitTransition { .. } => {
                self.circuit_transitions.fetch_add(1, Ordering::Relaxed);
            }
            SessionEvent::Suspended { .. } | SessionEvent::Resumed { .. } => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                created: self.sessions_created.load(Ordering::Relaxed),
                closed: self.sessions_closed.load(Ordering::Relaxed),
                processes_exited: self.processes_exited.load(Ordering::Relaxed),
            },
            streaming: StreamingMetrics {
                focus_changes: self.focus_changes.load(Ordering::Relaxed),
                buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
                chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            },
            connections: ConnectionMetrics {
                live: self.live_connections.load(Ordering::Relaxed),
                attached: self.connections_attached.load(Ordering::Relaxed),
                detached: self.connections_detached.load(Ordering::Relaxed),
            },
            resources: ResourceMetrics {
                rss_bytes: self.process_rss_bytes.load(Ordering::Relaxed),
                cpu_time_secs: self.process_cpu_ticks.load(Ordering::Relaxed)
                    / CLOCK_TICKS_PER_SEC,
            },
            circuit_transitions: self.circuit_transitions.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub streaming: StreamingMetrics,
    pub connections: ConnectionMetrics,
    pub resources: ResourceMetrics,
    pub circuit_transitions: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub created: u64,
    pub closed: u64,
    pub processes_exited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingMetrics {
    pub focus_changes: u64,
    pub buffer_overflows: u64,
    pub chunks_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub live: u64,
    pub attached: u64,
    pub detached: u64,
}

/// Approximate footprint of the tracked processes, summed across
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub rss_bytes: u64,
    pub cpu_time_secs: u64,
}

/// Subscribe to the bus and tally events until the bus closes.
pub fn spawn_collector(metrics: Arc<EngineMetrics>, events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => metrics.observe(&event),
                Err(RecvError::Lagged(missed)) => {
                    metrics.events_dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Periodically sample /proc for the tracked processes and refresh the
/// resource gauges. Read-only; never touches session state. Stops when
/// the registry is dropped.
pub fn spawn_resource_sampler(metrics: Arc<EngineMetrics>, registry: &Arc<SessionRegistry>) {
    let registry = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RESOURCE_SAMPLE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let mut rss = 0u64;
            let mut ticks = 0u64;
            for pid in registry.session_pids().await {
                if let Some((r, t)) = sample_process(pid) {
                    rss += r;
                    ticks += t;
                }
            }
            metrics.process_rss_bytes.store(rss, Ordering::Relaxed);
            metrics.process_cpu_ticks.store(ticks, Ordering::Relaxed);
        }
    });
}

/// Approximate (rss_bytes, cpu_ticks) for one pid. Exited pids simply
/// return None.
#[cfg(target_os = "linux")]
fn sample_process(pid: u32) -> Option<(u64, u64)> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // utime and stime come after the parenthesised command name.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    // Assumes 4 KiB pages.
    Some((rss_pages * 4096, utime + stime))
}

#[cfg(not(target_os = "linux"))]
fn sample_process(_pid: u32) -> Option<(u64, u64)> {
    None
}
