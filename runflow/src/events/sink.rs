//! Event sink trait and implementations.

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives run and job lifecycle events.
///
/// The scheduler emits from its coordinating loop, so implementations must
/// return quickly and must not fail.
pub trait EventSink: Send + Sync {
    /// Records one event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - One of the constants in [`crate::events`]
    /// * `data` - JSON payload; job events carry a `job` field
    fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to the tracing subscriber, lifting the `job` and `reason`
/// payload fields into structured fields.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self::info()
    }
}

impl LoggingEventSink {
    /// Logs at `level`; anything other than `DEBUG` logs at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

fn field<'a>(data: Option<&'a Value>, name: &str) -> &'a str {
    data.and_then(|d| d.get(name))
        .and_then(Value::as_str)
        .unwrap_or("-")
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        let job = field(data.as_ref(), "job");
        let reason = field(data.as_ref(), "reason");
        if self.level == Level::DEBUG {
            debug!(event_type, job, reason, event_data = ?data, "run event");
        } else {
            info!(event_type, job, reason, event_data = ?data, "run event");
        }
    }
}

/// Keeps every event in memory, for tests and for callers that build their
/// own summaries.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns the types of events whose `job` field equals `job`.
    #[must_use]
    pub fn event_types_for_job(&self, job: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(_, data)| field(data.as_ref(), "job") == job)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Returns the payloads of every event of `event_type`.
    #[must_use]
    pub fn payloads(&self, event_type: &str) -> Vec<Value> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .filter_map(|(_, data)| data.clone())
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
