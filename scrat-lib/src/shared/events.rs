use std::any::Any;
use std::fmt::{self, Display, Formatter};

use super::message::{Info, Message};

/// Statistics attached to a completed backup, echoed to the UI and
/// written into the manifest (§6.1).
#[derive(Debug, Clone, PartialEq)]
pub struct BackupStats {
    pub files_total: u64,
    pub size_original: u64,
    pub size_stored: u64,
    pub duration_seconds: f64,
    pub skipped_files: Vec<String>,
}

/// A single missed schedule run, offered to the UI for a run-now/skip/
/// run-latest-only decision (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct MissedRun {
    pub schedule_id: String,
    pub scheduled_for: chrono::DateTime<chrono::Utc>,
}

/// The typed event stream to the UI (§6.3). Each variant is wrapped in an
/// [`EventMessage`] and sent over the engine's [`super::msg_dispatcher::MsgDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BackupStarted {
        run_id: String,
    },
    BackupProgress {
        run_id: String,
        bytes_done: u64,
        bytes_total: u64,
        files_done: u64,
        files_total: u64,
        current_path: String,
        speed_bps: f64,
        eta_seconds: Option<f64>,
    },
    BackupCompleted {
        run_id: String,
        stats: BackupStats,
    },
    BackupFailed {
        run_id: String,
        kind: String,
        message: String,
    },
    RestoreStarted {
        run_id: String,
    },
    RestoreProgress {
        run_id: String,
        bytes_done: u64,
        bytes_total: u64,
        files_done: u64,
        files_total: u64,
        current_path: String,
    },
    RestoreCompleted {
        run_id: String,
    },
    RestoreFailed {
        run_id: String,
        kind: String,
        message: String,
    },
    StorageConnected {
        dest_id: String,
    },
    StorageDisconnected {
        dest_id: String,
    },
    ConfigChanged {
        kind: String,
    },
    MissedRuns {
        runs: Vec<MissedRun>,
    },
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Event::BackupStarted { run_id } => write!(f, "backup_started({run_id})"),
            Event::BackupProgress {
                run_id,
                bytes_done,
                bytes_total,
                ..
            } => write!(f, "backup_progress({run_id}, {bytes_done}/{bytes_total})"),
            Event::BackupCompleted { run_id, .. } => write!(f, "backup_completed({run_id})"),
            Event::BackupFailed {
                run_id,
                kind,
                message,
            } => write!(f, "backup_failed({run_id}, {kind}: {message})"),
            Event::RestoreStarted { run_id } => write!(f, "restore_started({run_id})"),
            Event::RestoreProgress {
                run_id,
                bytes_done,
                bytes_total,
                ..
            } => write!(f, "restore_progress({run_id}, {bytes_done}/{bytes_total})"),
            Event::RestoreCompleted { run_id } => write!(f, "restore_completed({run_id})"),
            Event::RestoreFailed {
                run_id,
                kind,
                message,
            } => write!(f, "restore_failed({run_id}, {kind}: {message})"),
            Event::StorageConnected { dest_id } => write!(f, "storage_connected({dest_id})"),
            Event::StorageDisconnected { dest_id } => write!(f, "storage_disconnected({dest_id})"),
            Event::ConfigChanged { kind } => write!(f, "config_changed({kind})"),
            Event::MissedRuns { runs } => write!(f, "missed_runs({})", runs.len()),
        }
    }
}

impl Info for Event {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wraps an [`Event`] as a [`Message`] for delivery over the dispatcher.
pub struct EventMessage {
    event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        EventMessage { event }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl Message for EventMessage {
    fn err(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        None
    }

    fn info(&self) -> Option<&(dyn Info + Send + Sync)> {
        Some(&self.event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for EventMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)
    }
}

/// Throttles [`Event::BackupProgress`]/[`Event::RestoreProgress`] emission to at
/// most `max_per_second` events per second (§6.3: "≤10 events/second per run").
/// Non-progress events are never throttled.
pub struct ProgressThrottle {
    min_interval: std::time::Duration,
    last_emit: Option<std::time::Instant>,
}

impl ProgressThrottle {
    pub fn new(max_per_second: u32) -> Self {
        ProgressThrottle {
            min_interval: std::time::Duration::from_secs_f64(1.0 / max_per_second as f64),
            last_emit: None,
        }
    }

    /// Returns true if a progress event should be emitted now.
    pub fn should_emit(&mut self, now: std::time::Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_event() {
        let mut throttle = ProgressThrottle::new(10);
        assert!(throttle.should_emit(std::time::Instant::now()));
    }

    #[test]
    fn throttle_rejects_immediate_repeat() {
        let mut throttle = ProgressThrottle::new(10);
        let now = std::time::Instant::now();
        assert!(throttle.should_emit(now));
        assert!(!throttle.should_emit(now));
    }
}
