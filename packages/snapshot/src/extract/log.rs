//! Run log.
//!
//! Every extraction run keeps its own log: the lines end up in the `log`
//! entry of the archive, and error lines double as the run's error list.
//! Each line is forwarded to `tracing` as well.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Four letter tag used in recorded lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Level::Debug => "DEBU",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERRO",
        }
    }
}

/// Ordered list of non-fatal (and fatal) error messages of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorList(Vec<String>);

impl ErrorList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

#[derive(Default)]
struct Records {
    lines: Vec<String>,
    errors: Vec<String>,
}

/// Shared, cloneable handle on a run log.
#[derive(Clone, Default)]
pub struct RunLog {
    records: Arc<Mutex<Records>>,
    fields: Arc<Vec<(String, String)>>,
}

impl RunLog {
    /// Creates a log whose lines all carry `fields`.
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self {
            records: Arc::default(),
            fields: Arc::new(fields),
        }
    }

    pub fn debug(&self, msg: &str, attrs: &[(&str, &dyn fmt::Display)]) {
        self.record(Level::Debug, msg, attrs);
    }

    pub fn info(&self, msg: &str, attrs: &[(&str, &dyn fmt::Display)]) {
        self.record(Level::Info, msg, attrs);
    }

    pub fn warn(&self, msg: &str, attrs: &[(&str, &dyn fmt::Display)]) {
        self.record(Level::Warn, msg, attrs);
    }

    /// Records an error line; `msg` also joins the error list.
    pub fn error(&self, msg: &str, attrs: &[(&str, &dyn fmt::Display)]) {
        self.record(Level::Error, msg, attrs);
    }

    pub fn record(&self, level: Level, msg: &str, attrs: &[(&str, &dyn fmt::Display)]) {
        let mut rendered = String::new();
        for (key, value) in self.fields.iter() {
            rendered.push_str(&format!("{key}={value:?} "));
        }
        for (key, value) in attrs {
            rendered.push_str(&format!("{key}={:?} ", value.to_string()));
        }

        let line = if rendered.is_empty() {
            format!("[{}] {msg}", level.tag())
        } else {
            format!("[{}] {msg} {}", level.tag(), rendered.trim_end())
        };

        match level {
            Level::Debug => tracing::debug!(fields = %rendered.trim_end(), "{msg}"),
            Level::Info => tracing::info!(fields = %rendered.trim_end(), "{msg}"),
            Level::Warn => tracing::warn!(fields = %rendered.trim_end(), "{msg}"),
            Level::Error => tracing::error!(fields = %rendered.trim_end(), "{msg}"),
        }

        let mut records = self.lock();
        records.lines.push(line);
        if level == Level::Error {
            records.errors.push(msg.to_string());
        }
    }

    /// Adds an error to the list without a log line.
    pub fn push_error(&self, err: impl Into<String>) {
        self.lock().errors.push(err.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    pub fn errors(&self) -> ErrorList {
        ErrorList(self.lock().errors.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        // A panic while holding the lock leaves plain vectors behind, still usable.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let log = RunLog::new(vec![("@id".to_string(), "abc".to_string())]);
        log.info("start", &[("idx", &0), ("url", &"http://example.net/")]);
        log.error("operation canceled", &[("err", &"too many redirects")]);

        assert_eq!(
            log.lines(),
            vec![
                r#"[INFO] start @id="abc" idx="0" url="http://example.net/""#,
                r#"[ERRO] operation canceled @id="abc" err="too many redirects""#,
            ]
        );
    }

    #[test]
    fn test_errors_from_error_lines() {
        let log = RunLog::default();
        log.warn("something odd", &[]);
        log.error("cannot load resource", &[]);
        log.push_error("extra");

        let errors = log.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.to_string(), "cannot load resource, extra");
        assert_eq!(log.lines(), vec!["[WARN] something odd", "[ERRO] cannot load resource"]);
    }
}
