//! Lifecycle events streamed to the caller while an operation runs.

use riptide_engine::{UnitId, UnitStatus};
use serde::Serialize;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StatusChanged {
        unit: UnitId,
        status: UnitStatus,
        at: String,
    },
    Progress {
        unit: UnitId,
        message: String,
    },
    Failed {
        unit: UnitId,
        failure: String,
    },
}

impl LifecycleEvent {
    pub fn status(unit: &UnitId, status: &UnitStatus) -> Self {
        Self::StatusChanged {
            unit: unit.clone(),
            status: status.clone(),
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn unit(&self) -> &UnitId {
        match self {
            Self::StatusChanged { unit, .. }
            | Self::Progress { unit, .. }
            | Self::Failed { unit, .. } => unit,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Forwards events to a channel; a dropped receiver silently discards them.
pub struct ChannelSink {
    tx: Mutex<Sender<LifecycleEvent>>,
}

impl ChannelSink {
    pub fn channel() -> (Self, Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Status changes of one unit, in order.
    pub fn statuses(&self, unit: &UnitId) -> Vec<UnitStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::StatusChanged { unit: u, status, .. } if &u == unit => Some(status),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Writes one JSON object per event and line, for machine-readable output.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: LifecycleEvent) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        let written = serde_json::to_writer(&mut *out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("dropping lifecycle event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_delivers_in_order() {
        let (sink, rx) = ChannelSink::channel();
        let unit = UnitId::service("shop", "www");
        sink.emit(LifecycleEvent::status(&unit, &UnitStatus::Starting));
        sink.emit(LifecycleEvent::status(&unit, &UnitStatus::Running));
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 2);
        assert!(matches!(
            &got[1],
            LifecycleEvent::StatusChanged { status: UnitStatus::Running, .. }
        ));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.emit(LifecycleEvent::Progress {
            unit: UnitId::service("shop", "www"),
            message: "pulling".to_owned(),
        });
    }

    #[test]
    fn memory_sink_filters_by_unit() {
        let sink = MemorySink::new();
        let www = UnitId::service("shop", "www");
        let db = UnitId::service("shop", "db");
        sink.emit(LifecycleEvent::status(&www, &UnitStatus::Starting));
        sink.emit(LifecycleEvent::status(&db, &UnitStatus::Starting));
        sink.emit(LifecycleEvent::status(&www, &UnitStatus::Running));
        assert_eq!(
            sink.statuses(&www),
            vec![UnitStatus::Starting, UnitStatus::Running]
        );
        assert_eq!(sink.events()[1].unit(), &db);
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let sink = JsonLinesSink::new(Vec::new());
        let unit = UnitId::service("shop", "www");
        sink.emit(LifecycleEvent::status(&unit, &UnitStatus::Starting));
        sink.emit(LifecycleEvent::Progress {
            unit,
            message: "pre-start: true".to_owned(),
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "progress");
        assert_eq!(second["message"], "pre-start: true");
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = LifecycleEvent::Failed {
            unit: UnitId::service("shop", "db"),
            failure: "timed out".to_owned(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"failed\""));
    }
}
