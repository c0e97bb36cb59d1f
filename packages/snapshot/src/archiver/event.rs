use std::collections::BTreeMap;
use std::fmt;

use crate::error::ArchiveError;

/// Progress of an archive run, sent to the event handler.
///
/// Events are advisory: handlers cannot influence the run.
#[derive(Debug)]
pub enum Event {
    /// The document is about to be processed
    StartHtml { url: String },
    /// A resource is requested, from the run cache or the network
    FetchUrl {
        uri: String,
        parent: String,
        cached: bool,
    },
    /// A resource was skipped or failed
    Error { err: ArchiveError, uri: String },
    Info(BTreeMap<String, String>),
}

impl Event {
    /// Structured fields of the event, for logging.
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Event::StartHtml { url } => vec![("url".into(), url.clone())],
            Event::FetchUrl {
                uri,
                parent,
                cached,
            } => vec![
                ("uri".into(), uri.clone()),
                ("parent".into(), parent.clone()),
                ("cached".into(), cached.to_string()),
            ],
            Event::Error { err, uri } => vec![("err".into(), err.to_string()), ("uri".into(), uri.clone())],
            Event::Info(fields) => fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::StartHtml { .. } => "start",
            Event::FetchUrl { .. } => "fetch",
            Event::Error { .. } => "error",
            Event::Info(_) => "info",
        };
        f.write_str(name)?;
        for (key, value) in self.fields() {
            write!(f, " {key}={value:?}")?;
        }
        Ok(())
    }
}
