//! Ordered adapter teardown with a per-phase log.
//!
//! Shutdown sequence (order matters):
//! 1. Detach the dispatch loop and let in-flight dispatch finish
//! 2. Stop the heartbeat sweep
//! 3. Close the outbound connection
//! 4. Close the listener, then the accepted connections
//! 5. Cancel remaining background tasks (delayed recalls, transport loops)
//! 6. Clear liveness state
//!
//! Every phase is attempted even when an earlier one failed.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// Shutdown phase identifiers (in execution order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    DetachingHandlers,
    StoppingHeartbeat,
    ClosingConnection,
    ClosingServer,
    CancellingTasks,
    ClearingState,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DetachingHandlers => write!(f, "detaching_handlers"),
            Self::StoppingHeartbeat => write!(f, "stopping_heartbeat"),
            Self::ClosingConnection => write!(f, "closing_connection"),
            Self::ClosingServer => write!(f, "closing_server"),
            Self::CancellingTasks => write!(f, "cancelling_tasks"),
            Self::ClearingState => write!(f, "clearing_state"),
        }
    }
}

/// Log entry for a completed shutdown phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseLog {
    pub phase: ShutdownPhase,
    pub duration_ms: u64,
    pub success: bool,
    pub message: Option<String>,
}

/// What a `stop()` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Empty when the call was a no-op.
    pub phases: Vec<PhaseLog>,
    pub total_ms: u64,
}

impl ShutdownReport {
    /// Whether the call actually tore anything down.
    pub fn performed(&self) -> bool {
        !self.phases.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.phases.iter().all(|p| p.success)
    }

    pub fn phase(&self, phase: ShutdownPhase) -> Option<&PhaseLog> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Tracks one shutdown in progress. Created when the shutdown begins.
pub struct ShutdownCoordinator {
    started_at: Instant,
    phase_log: Mutex<Vec<PhaseLog>>,
}

impl ShutdownCoordinator {
    pub fn initiate() -> Self {
        info!("Adapter shutdown initiated");
        Self {
            started_at: Instant::now(),
            phase_log: Mutex::new(Vec::new()),
        }
    }

    fn record(
        &self,
        phase: ShutdownPhase,
        started: Instant,
        success: bool,
        message: Option<String>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        if success {
            info!(phase = %phase, duration_ms, note = ?message, "Shutdown phase complete");
        } else {
            warn!(phase = %phase, duration_ms, error = ?message, "Shutdown phase failed, continuing");
        }

        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PhaseLog {
                phase,
                duration_ms,
                success,
                message,
            });
    }

    /// Run one phase: `Ok(note)` is success, `Err(reason)` is a logged failure.
    pub async fn run_phase<F>(&self, phase: ShutdownPhase, step: F)
    where
        F: std::future::Future<Output = Result<Option<String>, String>>,
    {
        let started = Instant::now();
        match step.await {
            Ok(note) => self.record(phase, started, true, note),
            Err(reason) => self.record(phase, started, false, Some(reason)),
        }
    }

    /// Close the sequence and return its report.
    pub fn finish(self) -> ShutdownReport {
        let total_ms = self.started_at.elapsed().as_millis() as u64;
        let phases = self
            .phase_log
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        info!(total_ms, phases = phases.len(), "Adapter shutdown complete");
        ShutdownReport { phases, total_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_names() {
        assert_eq!(ShutdownPhase::DetachingHandlers.to_string(), "detaching_handlers");
        assert_eq!(ShutdownPhase::StoppingHeartbeat.to_string(), "stopping_heartbeat");
        assert_eq!(ShutdownPhase::ClosingConnection.to_string(), "closing_connection");
        assert_eq!(ShutdownPhase::ClosingServer.to_string(), "closing_server");
        assert_eq!(ShutdownPhase::CancellingTasks.to_string(), "cancelling_tasks");
        assert_eq!(ShutdownPhase::ClearingState.to_string(), "clearing_state");
    }

    #[test]
    fn test_all_phases_ordered() {
        let phases = [
            ShutdownPhase::DetachingHandlers,
            ShutdownPhase::StoppingHeartbeat,
            ShutdownPhase::ClosingConnection,
            ShutdownPhase::ClosingServer,
            ShutdownPhase::CancellingTasks,
            ShutdownPhase::ClearingState,
        ];
        for pair in phases.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn test_failed_phase_does_not_stop_sequence() {
        let coord = ShutdownCoordinator::initiate();
        coord
            .run_phase(ShutdownPhase::ClosingConnection, async {
                Err("socket already gone".to_string())
            })
            .await;
        coord
            .run_phase(ShutdownPhase::ClosingServer, async { Ok(None) })
            .await;
        let report = coord.finish();

        assert!(report.performed());
        assert!(!report.all_succeeded());
        assert_eq!(report.phases.len(), 2);
        let failed = report.phase(ShutdownPhase::ClosingConnection).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.message.as_deref(), Some("socket already gone"));
        assert!(report.phase(ShutdownPhase::ClosingServer).unwrap().success);
    }

    #[test]
    fn test_default_report_is_noop() {
        let report = ShutdownReport::default();
        assert!(!report.performed());
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_report_serializes_phase_names() {
        let coord = ShutdownCoordinator::initiate();
        coord
            .run_phase(ShutdownPhase::ClearingState, async {
                Ok(Some("cleared".to_string()))
            })
            .await;
        let json = serde_json::to_value(coord.finish()).unwrap();
        assert_eq!(json["phases"][0]["phase"], "clearing_state");
        assert_eq!(json["phases"][0]["success"], true);
        assert_eq!(json["phases"][0]["message"], "cleared");
    }
}
