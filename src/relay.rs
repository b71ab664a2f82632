//! Turns log entries posted to the service into [`Entry`] values and writes them.
use crate::args;

use clap::ArgMatches;
use cloudlog::entry::{zulu_to_timestamp, Entry, LogEntryMetadata};
use cloudlog::log_common::WriteOptions;
use cloudlog::log_sync::LogSync;
use cloudlog::severity::Severity;
use cloudlog::structs::{Dynamic, ObjectRef};
use google_logging2::api::MonitoredResource;
use serde::Deserialize;
use slog::Logger;
use std::collections::HashMap;
use std::io::Write;
use thiserror::Error;

/// One posted log entry.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryRequest {
    pub severity: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub json_payload: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A request body: a single entry or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EntriesRequest {
    One(EntryRequest),
    Many(Vec<EntryRequest>),
}

impl EntriesRequest {
    pub fn into_vec(self) -> Vec<EntryRequest> {
        match self {
            EntriesRequest::One(entry) => vec![entry],
            EntriesRequest::Many(entries) => entries,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),

    #[error("invalid timestamp '{0}', expected RFC3339")]
    InvalidTimestamp(String),

    #[error("entry has neither a message nor a jsonPayload")]
    EmptyEntry,

    #[error("could not write entries: {0}")]
    Write(#[from] cloudlog::error::Error),
}

impl RelayError {
    /// Label value for the rejected entries metric.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::UnknownSeverity(_) => "unknown_severity",
            RelayError::InvalidTimestamp(_) => "invalid_timestamp",
            RelayError::EmptyEntry => "empty_entry",
            RelayError::Write(_) => "write_failed",
        }
    }
}

/// Where relayed entries go.
pub enum Target {
    /// Structured JSON lines, e.g. on stdout for a logging agent to pick up.
    Structured(LogSync<Box<dyn Write + Send>>),
    /// The service's own logger, with the request's trace context.
    Logger,
}

pub struct Relay {
    default_labels: HashMap<String, String>,
    resource: Option<MonitoredResource>,
    target: Target,
}

impl Relay {
    pub fn new(target: Target) -> Self {
        Relay {
            default_labels: HashMap::new(),
            resource: None,
            target,
        }
    }

    pub fn from_args(m: &ArgMatches) -> Result<Self, String> {
        let project_id = m.value_of(args::PROJECT_ID).unwrap_or_default();
        let log_name = m.value_of(args::LOG_NAME).unwrap_or(crate::app::NAME);

        let target = if m.is_present(args::STRUCTURED_STDOUT) {
            let transport: Box<dyn Write + Send> = Box::new(std::io::stdout());
            Target::Structured(LogSync::with_transport(project_id, log_name, transport))
        } else {
            Target::Logger
        };

        let default_labels = match m.value_of(args::DEFAULT_LABELS) {
            Some(labels) => serde_json::from_str(labels).map_err(|e| {
                format!("--{} must be a JSON object of strings: {}", args::DEFAULT_LABELS, e)
            })?,
            None => HashMap::new(),
        };
        let resource_labels = match m.value_of(args::RESOURCE_LABELS) {
            Some(labels) => Some(serde_json::from_str(labels).map_err(|e| {
                format!("--{} must be a JSON object of strings: {}", args::RESOURCE_LABELS, e)
            })?),
            None => None,
        };
        let resource = MonitoredResource {
            type_: m.value_of(args::RESOURCE_TYPE).map(str::to_string),
            labels: resource_labels,
        };

        Ok(Relay::new(target)
            .with_default_labels(default_labels)
            .with_resource(resource))
    }

    #[must_use]
    pub fn with_default_labels(self, default_labels: HashMap<String, String>) -> Self {
        Relay {
            default_labels,
            ..self
        }
    }

    #[must_use]
    pub fn with_resource(self, resource: MonitoredResource) -> Self {
        Relay {
            resource: Some(resource),
            ..self
        }
    }

    /// The writer label used in metrics.
    pub fn writer(&self) -> &'static str {
        match self.target {
            Target::Structured(_) => "structured",
            Target::Logger => "logger",
        }
    }

    /// Builds an entry from a posted one. The request headers are kept so the trace context of the
    /// request ends up in the entry.
    pub fn make_entry(
        &self,
        request: EntryRequest,
        headers: &http::HeaderMap,
    ) -> Result<Entry, RelayError> {
        let severity = match request.severity {
            Some(severity) => Some(
                severity
                    .parse::<Severity>()
                    .map_err(|e| RelayError::UnknownSeverity(e.0))?,
            ),
            None => None,
        };

        let timestamp = match request.timestamp {
            Some(ts) => Some(
                zulu_to_timestamp(&ts)
                    .to_datetime()
                    .filter(|dt| dt.timestamp() != 0 || dt.timestamp_subsec_nanos() != 0)
                    .ok_or(RelayError::InvalidTimestamp(ts))?,
            ),
            None => None,
        };

        let data = match (request.json_payload, request.message) {
            (Some(payload), _) => Dynamic::Object(ObjectRef::from(payload)),
            (None, Some(message)) => Dynamic::String(message),
            (None, None) => return Err(RelayError::EmptyEntry),
        };

        let mut labels = self.default_labels.clone();
        labels.extend(request.labels.unwrap_or_default());

        let metadata = LogEntryMetadata {
            timestamp,
            severity,
            labels: Some(labels).filter(|labels| !labels.is_empty()),
            resource: self.resource.clone(),
            request_headers: Some(headers.clone()),
            ..Default::default()
        };
        Ok(Entry::new(metadata, data))
    }

    /// Writes the entries to the target. `log` is the logger of the request.
    pub fn write(&self, entries: &[Entry], log: &Logger) -> Result<(), RelayError> {
        match &self.target {
            Target::Structured(log_sync) => {
                let options = WriteOptions {
                    labels: None,
                    resource: self.resource.clone(),
                };
                log_sync.write(entries, &options)?;
            }
            Target::Logger => {
                for entry in entries {
                    let text = match &entry.data {
                        Dynamic::String(s) => s.clone(),
                        data => data.to_json().to_string(),
                    };
                    // slog has fewer levels than Cloud Logging has severities.
                    match entry.metadata.severity.unwrap_or_default() {
                        Severity::Emergency | Severity::Alert | Severity::Critical => {
                            slog::crit!(log, "{}", text; "relayed" => true)
                        }
                        Severity::Error => slog::error!(log, "{}", text; "relayed" => true),
                        Severity::Warning => slog::warn!(log, "{}", text; "relayed" => true),
                        Severity::Notice | Severity::Info => {
                            slog::info!(log, "{}", text; "relayed" => true)
                        }
                        Severity::Debug | Severity::Default => {
                            slog::debug!(log, "{}", text; "relayed" => true)
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
