//! Structured event log for a `mirror`/`verify` run.
//!
//! Every event is timestamped relative to run start and fanned out to an
//! optional listener (consumed by `progress.rs`) as it's recorded, then the
//! full log can be dumped as newline-delimited JSON for `--debug`/CI
//! consumption.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SyncEvent {
    RunStarted { command: String },
    DiscoverComplete { target_serial: u64, todo: usize },
    ProjectStarted { project: String },
    ProjectSkipped { project: String, reason: String },
    ProjectSucceeded {
        project: String,
        files_downloaded: u64,
        bytes: u64,
        releases_kept: usize,
    },
    ProjectFailed { project: String, reason: String },
    DownloadStarted { project: String, filename: String },
    DownloadFinished { project: String, filename: String, bytes: u64 },
    SerialAdvanced { from: u64, to: u64 },
    VerifyRepaired { project: String, filename: String },
    RunFinished { succeeded: usize, failed: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent {
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Accumulates every `SyncEvent` emitted during a run, in order, and
/// optionally fans each one out live to a `listener` (the progress renderer).
pub struct EventLog {
    start: Instant,
    events: Vec<TimestampedEvent>,
    listener: Option<EventListener>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self { start: Instant::now(), events: Vec::new(), listener: None }
    }

    pub fn set_listener(&mut self, listener: EventListener) {
        self.listener = Some(listener);
    }

    pub fn record(&mut self, event: SyncEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        self.events.push(TimestampedEvent { elapsed_ms, event });
    }

    pub fn events(&self) -> &[TimestampedEvent] {
        &self.events
    }

    /// Newline-delimited JSON, one object per event (`--format json`).
    pub fn to_ndjson(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared handle so the worker pool's concurrent pipeline invocations can
/// all record onto the same run log.
pub type EventSink = Arc<Mutex<EventLog>>;

pub fn emit(sink: &EventSink, event: SyncEvent) {
    if let Ok(mut log) = sink.lock() {
        log.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn listener_observes_every_recorded_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut log = EventLog::new();
        log.set_listener(Box::new(move |event| {
            if let SyncEvent::ProjectStarted { project } = event {
                seen_clone.lock().unwrap().push(project.clone());
            }
        }));
        log.record(SyncEvent::ProjectStarted { project: "peerme".into() });
        log.record(SyncEvent::ProjectSucceeded {
            project: "peerme".into(),
            files_downloaded: 1,
            bytes: 10,
            releases_kept: 1,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["peerme".to_string()]);
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn ndjson_emits_one_line_per_event() {
        let mut log = EventLog::new();
        log.record(SyncEvent::RunStarted { command: "mirror".into() });
        log.record(SyncEvent::RunFinished { succeeded: 1, failed: 0 });
        assert_eq!(log.to_ndjson().lines().count(), 2);
    }
}
