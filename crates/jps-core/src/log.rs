//! Request Log - the textual log stream returned with a work response
//!
//! Every line is kept for the response and mirrored to `tracing`, so the host
//! decides how (and whether) process-wide logging is rendered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Kind of a build message reported by the loop or a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
    Info,
    /// Internal information about the build itself, never an error
    JpsInfo,
    Progress,
}

#[derive(Debug, Clone)]
pub struct BuildMessage {
    pub kind: MessageKind,
    pub text: String,
}

impl BuildMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Per-request log
pub struct RequestLog {
    lines: Mutex<Vec<String>>,
    has_errors: AtomicBool,
    is_debug_enabled: bool,
}

impl RequestLog {
    pub fn new(is_debug_enabled: bool) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            has_errors: AtomicBool::new(false),
            is_debug_enabled,
        }
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.is_debug_enabled
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{message}");
        self.push(format!("INFO: {message}"));
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!("{message}");
        self.push(format!("WARN: {message}"));
    }

    /// Record an error-level diagnostic. The build will not report success.
    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!("{message}");
        self.has_errors.store(true, Ordering::Release);
        self.push(format!("ERROR: {message}"));
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{message}");
        if self.is_debug_enabled {
            self.push(format!("DEBUG: {message}"));
        }
    }

    /// Record a message reported by a stage or by the loop
    pub fn process_message(&self, message: BuildMessage) {
        match message.kind {
            MessageKind::Error => self.error(&message.text),
            MessageKind::Warning => self.warn(&message.text),
            MessageKind::Info | MessageKind::JpsInfo => self.info(&message.text),
            MessageKind::Progress => {
                info!(progress = true, "{}", message.text);
                self.push(message.text);
            }
        }
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::Acquire)
    }

    /// Forget recorded diagnostics before a retry. Text lines are kept.
    pub fn reset_state(&self) {
        self.has_errors.store(false, Ordering::Release);
        self.push("INFO: diagnostics reset, retrying build from scratch".to_string());
    }

    pub fn measure_time<T>(&self, label: &str, action: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = action();
        self.info(format!("{label} took {:?}", start.elapsed()));
        result
    }

    /// Full textual log, one line per message
    pub fn output(&self) -> String {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .join("\n")
    }

    fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}
