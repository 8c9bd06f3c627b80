//! Logging callback injected into every audio backend.
//!
//! Backends report through the [`AudioLog`] handed to them at open time,
//! so an embedding process can route audio diagnostics wherever it wants;
//! only the thin native wrappers log straight to the `log` facade. The same
//! handle is cloned into background threads (the event pump, the live
//! output thread).
//!
//! Clones share one severity threshold. Each opened device gets its own
//! threshold through [`AudioLog::scoped`], so raising one device's level
//! leaves the others alone.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Severity levels understood by the audio layer, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Severity {
    /// The `log` facade level used by [`AudioLog::to_log`].
    pub fn as_log_level(self) -> log::Level {
        match self {
            Severity::Critical | Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Notice | Severity::Info => log::Level::Info,
            Severity::Debug => log::Level::Debug,
        }
    }

    const ALL: [Severity; 6] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Notice,
        Severity::Info,
        Severity::Debug,
    ];

    fn from_u8(value: u8) -> Self {
        Self::ALL.get(usize::from(value)).copied().unwrap_or(Severity::Debug)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "error" => Ok(Severity::Error),
            "warning" => Ok(Severity::Warning),
            "notice" => Ok(Severity::Notice),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

type SinkFn = dyn Fn(Severity, fmt::Arguments<'_>) + Send + Sync;

/// Cloneable handle to a logging callback.
#[derive(Clone)]
pub struct AudioLog {
    sink: Arc<SinkFn>,
    /// Least severe level still forwarded.
    threshold: Arc<AtomicU8>,
}

impl AudioLog {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(Severity, fmt::Arguments<'_>) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
            threshold: Arc::new(AtomicU8::new(Severity::Debug as u8)),
        }
    }

    /// Same callback, with a threshold of its own starting at the current level.
    pub fn scoped(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            threshold: Arc::new(AtomicU8::new(self.threshold.load(Ordering::Relaxed))),
        }
    }

    /// Forward only messages at `level` or more severe.
    pub fn set_level(&self, level: Severity) {
        self.threshold.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> Severity {
        Severity::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity as u8 <= self.threshold.load(Ordering::Relaxed)
    }

    /// Forward everything to the `log` facade under the `audio` target.
    pub fn to_log() -> Self {
        Self::new(|severity, args| {
            if severity == Severity::Critical {
                log::log!(target: "audio", severity.as_log_level(), "CRITICAL: {}", args);
            } else {
                log::log!(target: "audio", severity.as_log_level(), "{}", args);
            }
        })
    }

    /// Drop everything.
    pub fn discard() -> Self {
        Self::new(|_, _| {})
    }

    pub fn log(&self, severity: Severity, args: fmt::Arguments<'_>) {
        if self.enabled(severity) {
            (self.sink)(severity, args)
        }
    }

    pub fn critical(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Critical, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Error, args)
    }

    pub fn warning(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Warning, args)
    }

    pub fn notice(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Notice, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Severity::Debug, args)
    }
}

impl Default for AudioLog {
    fn default() -> Self {
        Self::to_log()
    }
}

impl fmt::Debug for AudioLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLog").field("level", &self.level()).finish()
    }
}
