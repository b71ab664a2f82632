use crate::entry::{Entry, LogEntryMetadata, LABELS_KEY};
use crate::error::Result;
use crate::log_common::{assign_severity_to_entries, format_log_name, snakecase_keys, WriteOptions};
use crate::severity::Severity;
use crate::structs::Dynamic;

use google_logging2::api::MonitoredResource;
use serde_json::Value;
use std::io::{self, Write};
use std::sync::Mutex;

/// Writes log entries synchronously, one structured JSON line per entry, to a transport.
///
/// Logging agents (e.g. on GKE or Cloud Run) pick these lines up from stdout and forward them to
/// Cloud Logging, so nothing here talks to the API.
///
/// # Example
///
/// ```
/// use cloudlog::entry::LogEntryMetadata;
/// use cloudlog::log_common::WriteOptions;
/// use cloudlog::log_sync::LogSync;
///
/// let log = LogSync::with_transport("my-project", "relay", Vec::new());
/// let entry = log.entry(LogEntryMetadata::default(), "hello");
/// log.info(&[entry], &WriteOptions::default());
/// ```
pub struct LogSync<W: Write = io::Stdout> {
    project_id: String,
    formatted_name: String,
    name: String,
    detected_resource: Option<MonitoredResource>,
    use_message_field: bool,
    transport: Mutex<W>,
}

impl LogSync<io::Stdout> {
    /// Creates a writer for the log `name` that writes to stdout.
    pub fn new(project_id: &str, name: &str) -> Self {
        Self::with_transport(project_id, name, io::stdout())
    }
}

impl<W: Write> LogSync<W> {
    /// Creates a writer for the log `name` that writes to `transport`.
    pub fn with_transport(project_id: &str, name: &str, transport: W) -> Self {
        let formatted_name = format_log_name(project_id, name);
        let name = formatted_name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        LogSync {
            project_id: project_id.to_string(),
            formatted_name,
            name,
            detected_resource: None,
            use_message_field: true,
            transport: Mutex::new(transport),
        }
    }

    /// Sets the resource detected for the environment. It takes precedence over the resource of
    /// the write options.
    #[must_use]
    pub fn with_detected_resource(mut self, resource: MonitoredResource) -> Self {
        self.detected_resource = Some(resource);
        self
    }

    /// Merges object payloads into the top level of each line instead of nesting them under
    /// `message`.
    #[must_use]
    pub fn with_merged_payloads(mut self) -> Self {
        self.use_message_field = false;
        self
    }

    /// The log id, percent-encoded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full log name: `projects/{project_id}/logs/{name}`.
    pub fn formatted_name(&self) -> &str {
        &self.formatted_name
    }

    /// Creates an entry for this log.
    pub fn entry<D: Into<Dynamic>>(&self, metadata: LogEntryMetadata, data: D) -> Entry {
        Entry::new(metadata, data)
    }

    pub fn emergency(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Emergency, options)
    }

    pub fn alert(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Alert, options)
    }

    pub fn critical(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Critical, options)
    }

    pub fn error(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Error, options)
    }

    pub fn warning(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Warning, options)
    }

    pub fn notice(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Notice, options)
    }

    pub fn info(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Info, options)
    }

    pub fn debug(&self, entries: &[Entry], options: &WriteOptions) {
        self.write_with_severity(entries, Severity::Debug, options)
    }

    // The severity helpers never fail the caller.
    fn write_with_severity(&self, entries: &[Entry], severity: Severity, options: &WriteOptions) {
        let _ = self.write(&assign_severity_to_entries(entries, severity), options);
    }

    /// Writes the entries, one line each, stopping at the first transport error.
    ///
    /// Every line gets this log's name and the resource. Labels of the options replace those of
    /// the entry.
    pub fn write(&self, entries: &[Entry], options: &WriteOptions) -> Result<()> {
        let resource = self.detect_resource(options);
        let resource = match resource {
            Some(resource) => serde_json::to_value(resource).ok(),
            None => None,
        };

        let mut transport = self
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries {
            let mut line = entry.to_structured_json(&self.project_id, self.use_message_field);
            line.insert("logName".into(), self.formatted_name.clone().into());
            if let Some(resource) = &resource {
                line.insert("resource".into(), resource.clone());
            }
            if let Some(labels) = &options.labels {
                let labels = labels
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                line.insert(LABELS_KEY.into(), Value::Object(labels));
            }
            let mut bytes = Value::Object(line).to_string().into_bytes();
            bytes.push(b'\n');
            transport.write_all(&bytes)?;
        }
        transport.flush()?;
        Ok(())
    }

    /// Hands back the transport.
    pub fn into_transport(self) -> W {
        self.transport
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn detect_resource(&self, options: &WriteOptions) -> Option<MonitoredResource> {
        if let Some(detected) = &self.detected_resource {
            return Some(detected.clone());
        }
        options.resource.clone().map(|mut resource| {
            resource.labels = resource.labels.map(snakecase_keys);
            resource
        })
    }
}
