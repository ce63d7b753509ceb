//! Heartbeat monitor: per-bot liveness from lifecycle and heartbeat events.
//!
//! Some bot implementations never send a lifecycle disconnect, so a bot is
//! also considered gone once it has been silent for more than
//! `UNRESPONSIVE_MULTIPLIER` heartbeat intervals. Queries apply that cutoff
//! directly; the background sweep evicts stale entries and announces them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A bot is unresponsive after this many silent heartbeat intervals.
const UNRESPONSIVE_MULTIPLIER: u32 = 2;

/// Capacity of the liveness broadcast channel.
const EVENT_BUFFER: usize = 64;

/// Liveness transitions, for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// First lifecycle-connect or heartbeat from a bot.
    Connected { self_id: i64 },
    /// Explicit lifecycle disconnect.
    Disconnected { self_id: i64 },
    /// Evicted by the sweep after missing heartbeats.
    Lost { self_id: i64, silent_ms: u64 },
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveConnection {
    pub self_id: i64,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    last_seen: Instant,
    connected_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

#[derive(Clone)]
struct LivenessTable {
    entries: Arc<DashMap<i64, Entry>>,
    events: broadcast::Sender<LivenessEvent>,
    timeout: Duration,
}

impl LivenessTable {
    fn is_fresh(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) <= self.timeout
    }

    fn touch(&self, self_id: i64) -> bool {
        let now = Utc::now();
        let mut inserted = false;
        self.entries
            .entry(self_id)
            .and_modify(|e| {
                e.last_seen = Instant::now();
                e.last_seen_at = now;
            })
            .or_insert_with(|| {
                inserted = true;
                Entry {
                    last_seen: Instant::now(),
                    connected_at: now,
                    last_seen_at: now,
                }
            });
        if inserted {
            let _ = self.events.send(LivenessEvent::Connected { self_id });
        }
        inserted
    }

    fn sweep(&self) -> Vec<i64> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.entries.retain(|self_id, entry| {
            if self.is_fresh(entry, now) {
                return true;
            }
            let silent_ms = now.saturating_duration_since(entry.last_seen).as_millis() as u64;
            warn!(self_id, silent_ms, "Bot disconnected (heartbeat timeout)");
            evicted.push((*self_id, silent_ms));
            false
        });
        for (self_id, silent_ms) in &evicted {
            let _ = self.events.send(LivenessEvent::Lost {
                self_id: *self_id,
                silent_ms: *silent_ms,
            });
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }
}

struct SweepTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks last-seen times per bot self id.
pub struct HeartbeatMonitor {
    table: LivenessTable,
    interval: Duration,
    sweep: Mutex<Option<SweepTask>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            table: LivenessTable {
                entries: Arc::new(DashMap::new()),
                events,
                timeout: interval * UNRESPONSIVE_MULTIPLIER,
            },
            interval,
            sweep: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence after which a bot is no longer considered alive.
    pub fn timeout(&self) -> Duration {
        self.table.timeout
    }

    pub fn on_connect(&self, self_id: i64) {
        info!(self_id, "Bot connected");
        self.table.touch(self_id);
    }

    pub fn on_heartbeat(&self, self_id: i64) {
        if self.table.touch(self_id) {
            info!(self_id, "Bot seen for the first time via heartbeat");
        } else {
            debug!(self_id, "Heartbeat");
        }
    }

    pub fn on_disconnect(&self, self_id: i64) {
        info!(self_id, "Bot disconnected");
        if self.table.entries.remove(&self_id).is_some() {
            let _ = self
                .table
                .events
                .send(LivenessEvent::Disconnected { self_id });
        }
    }

    /// Whether `self_id` has been seen within the timeout.
    pub fn is_alive(&self, self_id: i64) -> bool {
        let now = Instant::now();
        self.table
            .entries
            .get(&self_id)
            .is_some_and(|e| self.table.is_fresh(&e, now))
    }

    /// Every bot considered alive right now, ordered by self id.
    pub fn live_connections(&self) -> Vec<LiveConnection> {
        let now = Instant::now();
        let mut live: Vec<LiveConnection> = self
            .table
            .entries
            .iter()
            .filter(|e| self.table.is_fresh(e.value(), now))
            .map(|e| LiveConnection {
                self_id: *e.key(),
                connected_at: e.connected_at,
                last_seen_at: e.last_seen_at,
            })
            .collect();
        live.sort_by_key(|c| c.self_id);
        live
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.table.events.subscribe()
    }

    /// Evict every entry silent for longer than the timeout. Returns the
    /// evicted self ids.
    pub fn sweep(&self) -> Vec<i64> {
        self.table.sweep()
    }

    /// Forget every bot.
    pub fn clear(&self) {
        self.table.entries.clear();
    }

    /// Launch the periodic sweep. A second call while one is running is a
    /// no-op.
    pub fn start_sweep(&self) {
        let mut guard = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let table = self.table.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        table.sweep();
                    }
                }
            }
            debug!("Heartbeat sweep stopped");
        });

        *guard = Some(SweepTask {
            shutdown_tx,
            handle,
        });
        debug!(interval_ms = period.as_millis() as u64, "Heartbeat sweep started");
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Cancel the sweep and wait up to `timeout` for it to acknowledge.
    ///
    /// Returns `false` if the task had to be aborted after the timeout.
    /// Stopping a sweep that is not running returns `true`.
    pub async fn stop_sweep(&self, timeout: Duration) -> bool {
        let task = self
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(SweepTask {
            shutdown_tx,
            mut handle,
        }) = task
        else {
            return true;
        };

        shutdown_tx.send_replace(true);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                handle.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const I: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_present_at_one_and_a_half_intervals() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.start_sweep();
        monitor.on_connect(1);

        tokio::time::advance(I * 3 / 2).await;
        assert!(monitor.is_alive(1));
        assert_eq!(monitor.live_connections().len(), 1);
        monitor.stop_sweep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_after_two_point_one_intervals() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.start_sweep();
        monitor.on_connect(1);

        tokio::time::advance(I * 21 / 10).await;
        assert!(!monitor.is_alive(1));
        assert!(monitor.live_connections().is_empty());
        monitor.stop_sweep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_evicted_at_exactly_two_intervals() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.on_connect(1);
        tokio::time::advance(I * 2).await;
        assert!(monitor.is_alive(1));
        assert!(monitor.sweep().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.on_connect(1);
        tokio::time::advance(I * 3 / 2).await;
        monitor.on_heartbeat(1);
        tokio::time::advance(I * 3 / 2).await;
        assert!(monitor.is_alive(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_and_announces() {
        let monitor = HeartbeatMonitor::new(I);
        let mut events = monitor.subscribe();
        monitor.start_sweep();
        monitor.on_heartbeat(5);
        assert_eq!(
            events.recv().await.unwrap(),
            LivenessEvent::Connected { self_id: 5 }
        );

        // Ticks at I, 2I and 3I; the 3I tick evicts.
        for _ in 0..3 {
            tokio::time::advance(I).await;
            tokio::task::yield_now().await;
        }
        match events.recv().await.unwrap() {
            LivenessEvent::Lost { self_id, silent_ms } => {
                assert_eq!(self_id, 5);
                assert!(silent_ms > (I * 2).as_millis() as u64);
            }
            other => panic!("expected Lost, got {other:?}"),
        }
        assert!(!monitor.is_alive(5));
        assert!(monitor.stop_sweep(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_removes_immediately() {
        let monitor = HeartbeatMonitor::new(I);
        let mut events = monitor.subscribe();
        monitor.on_connect(1);
        monitor.on_disconnect(1);
        assert!(!monitor.is_alive(1));
        assert_eq!(
            events.recv().await.unwrap(),
            LivenessEvent::Connected { self_id: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LivenessEvent::Disconnected { self_id: 1 }
        );

        // Unknown bot: no event.
        monitor.on_disconnect(2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_sweep_is_idempotent() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.start_sweep();
        assert!(monitor.is_sweeping());
        assert!(monitor.stop_sweep(Duration::from_secs(1)).await);
        assert!(!monitor.is_sweeping());
        assert!(monitor.stop_sweep(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let monitor = HeartbeatMonitor::new(I);
        monitor.on_connect(1);
        monitor.on_connect(2);
        assert_eq!(
            monitor
                .live_connections()
                .iter()
                .map(|c| c.self_id)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        monitor.clear();
        assert!(monitor.live_connections().is_empty());
    }
}
