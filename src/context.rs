// Backend context - configuration plus a diagnostics sink
//
// Passed explicitly to the device selector, the shader reflector and object
// state so warnings can be observed without process-wide state.

use crate::config::Config;
use log::Level;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Receives warnings and errors raised by the backend.
pub trait Diagnostics: Send + Sync {
    fn record(&self, level: Level, target: &str, message: &str);
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn record(&self, level: Level, target: &str, message: &str) {
        log::log!(target: target, level, "{}", message);
    }
}

/// Keeps every diagnostic in memory, then forwards it to `log`.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    entries: Mutex<Vec<(Level, String)>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries.lock().clone()
    }

    /// Messages recorded at `Level::Warn`.
    pub fn warnings(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(level, _)| *level == Level::Warn)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn record(&self, level: Level, target: &str, message: &str) {
        self.entries.lock().push((level, message.to_string()));
        log::log!(target: target, level, "{}", message);
    }
}

/// Shared configuration and diagnostics for one backend instance.
#[derive(Clone)]
pub struct BackendContext {
    config: Arc<Config>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl BackendContext {
    pub fn new(config: Config) -> Self {
        Self::with_diagnostics(config, Arc::new(LogDiagnostics))
    }

    pub fn with_diagnostics(config: Config, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            config: Arc::new(config),
            diagnostics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn warn(&self, target: &str, message: impl fmt::Display) {
        self.diagnostics
            .record(Level::Warn, target, &message.to_string());
    }

    pub fn error(&self, target: &str, message: impl fmt::Display) {
        self.diagnostics
            .record(Level::Error, target, &message.to_string());
    }
}

impl Default for BackendContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_warnings_only_in_warnings() {
        let sink = Arc::new(RecordingDiagnostics::new());
        let ctx = BackendContext::with_diagnostics(Config::default(), sink.clone());

        ctx.warn("test", "first");
        ctx.error("test", "broken");
        ctx.warn("test", format_args!("second {}", 2));

        assert_eq!(sink.warnings(), vec!["first".to_string(), "second 2".to_string()]);
        assert_eq!(sink.entries().len(), 3);

        sink.clear();
        assert!(sink.entries().is_empty());
    }
}
