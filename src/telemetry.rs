//! Telemetry
//!
//! Where degraded-but-handled failures get reported. The default sink
//! writes them to the tracing subscriber; hosts can plug in their own.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Exception and event reporting
pub trait Telemetry: Send + Sync {
    /// Report a handled failure
    fn track_exception(&self, context: &str, error: &dyn std::error::Error);

    /// Report a named event with properties
    fn track_event(&self, name: &str, properties: &BTreeMap<String, String>);
}

/// Reports through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track_exception(&self, context: &str, error: &dyn std::error::Error) {
        tracing::warn!(context = context, "Handled exception: {}", error);
    }

    fn track_event(&self, name: &str, properties: &BTreeMap<String, String>) {
        tracing::info!(event = name, ?properties, "Telemetry event");
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    exceptions: Mutex<Vec<String>>,
    events: Mutex<Vec<String>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded exceptions as `context: message`
    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Recorded event names
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Telemetry for RecordingTelemetry {
    fn track_exception(&self, context: &str, error: &dyn std::error::Error) {
        if let Ok(mut exceptions) = self.exceptions.lock() {
            exceptions.push(format!("{}: {}", context, error));
        }
    }

    fn track_event(&self, name: &str, _properties: &BTreeMap<String, String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_recording_telemetry() {
        let telemetry = RecordingTelemetry::new();
        telemetry.track_exception("login", &Error::Identity("popup closed".into()));
        telemetry.track_event("logout", &BTreeMap::new());

        assert_eq!(telemetry.exceptions(), vec!["login: Identity provider error: popup closed".to_string()]);
        assert_eq!(telemetry.events(), vec!["logout".to_string()]);
    }
}
