//! Event logger - persists run events to JSONL files
//!
//! Events land in `<repo>/runs/<run-id>/events.jsonl` so finished runs can be
//! replayed after they leave memory or the daemon restarts.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{ActionEvent, EventLogEntry};

const EVENTS_FILE: &str = "events.jsonl";

pub struct EventLogger {
    runs_dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl EventLogger {
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        let runs_dir = runs_dir.as_ref().to_path_buf();
        debug!(?runs_dir, "EventLogger::new: creating logger");
        Self {
            runs_dir,
            writers: HashMap::new(),
        }
    }

    /// Append an event to its run's log file
    pub fn write_event(&mut self, event: &ActionEvent) -> eyre::Result<()> {
        let run_id = event.run_id();
        debug!(%run_id, event_type = event.event_type(), "EventLogger::write_event");

        if !self.writers.contains_key(run_id) {
            let run_dir = self.runs_dir.join(run_id);
            fs::create_dir_all(&run_dir)?;
            let log_path = run_dir.join(EVENTS_FILE);
            debug!(?log_path, "EventLogger: creating new log file");
            let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            self.writers.insert(run_id.to_string(), BufWriter::new(file));
        }
        let Some(writer) = self.writers.get_mut(run_id) else {
            return Ok(());
        };

        let json = serde_json::to_string(&EventLogEntry::new(event.clone()))?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    /// Drop the writer of a finished run
    pub fn close_run(&mut self, run_id: &str) {
        debug!(%run_id, "EventLogger::close_run");
        if let Some(mut writer) = self.writers.remove(run_id) {
            let _ = writer.flush();
        }
    }

    /// Consume events from the bus until it closes
    pub async fn run(mut self, event_bus: Arc<EventBus>) {
        debug!("EventLogger::run: starting event logger");
        let mut rx = event_bus.subscribe();
        drop(event_bus);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        error!(run_id = event.run_id(), error = %e, "EventLogger: failed to write event");
                    }
                    if event.is_terminal() {
                        self.close_run(event.run_id());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        for (run_id, mut writer) in self.writers.drain() {
            debug!(%run_id, "EventLogger: flushing writer on shutdown");
            let _ = writer.flush();
        }
    }
}

/// Read the persisted events of a run, oldest first
///
/// Unknown runs yield an empty list; unparseable lines are skipped.
pub fn read_run_events(runs_dir: impl AsRef<Path>, run_id: &str) -> eyre::Result<Vec<EventLogEntry>> {
    let log_path = runs_dir.as_ref().join(run_id).join(EVENTS_FILE);
    debug!(?log_path, "read_run_events: reading log file");

    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&log_path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_run_events: failed to parse line"),
        }
    }

    debug!(count = entries.len(), "read_run_events: loaded entries");
    Ok(entries)
}

/// Spawn the event logger as a background task
pub fn spawn_event_logger(event_bus: Arc<EventBus>, runs_dir: impl AsRef<Path>) -> tokio::task::JoinHandle<()> {
    let logger = EventLogger::new(runs_dir);
    tokio::spawn(async move {
        logger.run(event_bus).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ErrorInfo;
    use tempfile::tempdir;

    fn output(run_id: &str, line: &str) -> ActionEvent {
        ActionEvent::Output {
            run_id: run_id.to_string(),
            rule: "shell.run".to_string(),
            line: line.to_string(),
            stderr: false,
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let temp = tempdir().unwrap();
        let mut logger = EventLogger::new(temp.path());

        logger.write_event(&output("r1", "one")).unwrap();
        logger.write_event(&output("r1", "two")).unwrap();
        logger.write_event(&output("r2", "other")).unwrap();

        let entries = read_run_events(temp.path(), "r1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, output("r1", "two"));
        assert_eq!(read_run_events(temp.path(), "r2").unwrap().len(), 1);
    }

    #[test]
    fn test_read_unknown_run() {
        let temp = tempdir().unwrap();
        assert!(read_run_events(temp.path(), "missing").unwrap().is_empty());
    }

    #[test]
    fn test_bad_lines_skipped() {
        let temp = tempdir().unwrap();
        let mut logger = EventLogger::new(temp.path());
        logger.write_event(&output("r1", "ok")).unwrap();
        logger.close_run("r1");

        let path = temp.path().join("r1").join(EVENTS_FILE);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        fs::write(&path, content).unwrap();

        assert_eq!(read_run_events(temp.path(), "r1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_logger_task_persists_bus_events() {
        let temp = tempdir().unwrap();
        let bus = Arc::new(EventBus::new(64));
        let handle = spawn_event_logger(bus.clone(), temp.path());

        // Wait for the logger to subscribe before emitting
        while bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.emit(output("r1", "line"));
        bus.emit(ActionEvent::Failed {
            run_id: "r1".to_string(),
            error: ErrorInfo::request("boom"),
        });
        drop(bus);
        handle.await.unwrap();

        let entries = read_run_events(temp.path(), "r1").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].event.is_terminal());
    }
}
