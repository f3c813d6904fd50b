use std::sync::Mutex;

/// A progress line produced while a conversion runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Where log events go. Implementations must deliver in call order.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Routes events into `tracing` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, event: LogEvent) {
        tracing::info!(target: "stepmesh::module", "{}", event.message);
    }
}

/// Collects events in memory.
impl LogSink for Mutex<Vec<LogEvent>> {
    fn emit(&self, event: LogEvent) {
        if let Ok(mut events) = self.lock() {
            events.push(event);
        }
    }
}
