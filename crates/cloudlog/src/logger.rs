#[cfg(feature = "shipper")]
use crate::shipper;

use crate::entry::{Entry, LogEntryMetadata, ToJsonOptions};
use crate::error::Error;
use crate::http_request::HttpRequest;
use crate::severity::Severity;
use crate::structs::{Dynamic, ObjectRef};

use google_logging2::api::{MonitoredResource, WriteLogEntriesRequest};

use slog::{self, Drain, Key, Level, Never, OwnedKVList, Record, KV};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;

use std::sync::mpsc::sync_channel;

/// Builder for the [`Logger`]
#[derive(Default, Debug)]
pub struct Builder {
    log_name: String,
    log_level_label: Option<String>,
    resource_type: String,
    default_labels: HashMap<String, String>,
    resource_labels: Option<HashMap<String, String>>,
    project_id: Option<String>,
    remove_circular: bool,
}

/// Main struct for the Cloud Logging drain
pub struct Logger {
    log_name: String,
    log_level_label: Option<String>,
    default_labels: HashMap<String, String>,
    resource: MonitoredResource,
    project_id: String,
    options: ToJsonOptions,
    sync_tx: std::sync::mpsc::SyncSender<WriteLogEntriesRequest>,
}

impl Builder {
    /// Creates a Builder object.
    ///
    /// # Parameters
    /// - `log_name`: The `logName` string to be used in the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry)
    /// - `resource_type`: The required `type` field set in the `resource` [MonitoredResource](https://cloud.google.com/logging/docs/reference/v2/rest/v2/MonitoredResource) object of the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry). For example: `k8s_container`.
    ///
    /// # Example
    ///
    /// ```
    /// use cloudlog::logger::Builder;
    /// let (drain, _) = Builder::new(
    ///     "projects/my-gcp-project/logs/my-log-id",
    ///     "k8s_container",
    /// )
    /// .build();
    /// ```
    ///
    #[must_use = "The builder must be used"]
    pub fn new(log_name: &str, resource_type: &str) -> Self {
        Self {
            log_name: log_name.to_string(),
            resource_type: resource_type.to_string(),
            ..Default::default()
        }
    }

    /// Sets resource labels to be applied.
    ///
    /// These labels will populate the `labels` field in the `resource` [MonitoredResource](https://cloud.google.com/logging/docs/reference/v2/rest/v2/MonitoredResource) object of the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry).
    ///
    /// # Example
    ///
    /// ```
    /// use serde_json::json;
    /// let resource_labels = json!(
    /// {
    ///     "location": "europe-west1-b",
    ///     "pod_name": std::env::var("HOSTNAME").unwrap_or_default(),
    ///     "container_name": "my-app",
    ///     "project_id": "my-gcp-project",
    ///     "cluster_name": "my-gke-cluster",
    ///     "namespace_name": "my-gke-namespace"
    /// });
    ///
    /// use cloudlog::logger::Builder;
    /// let (drain, _) = Builder::new(
    ///     "projects/my-gcp-project/logs/my-log-id",
    ///     "k8s_container",
    /// )
    /// .with_resource_labels(resource_labels)
    /// .unwrap()
    /// .build();
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if `labels` is not an object of strings.
    #[must_use = "The builder must be used"]
    pub fn with_resource_labels(self, labels: serde_json::Value) -> Result<Self, Error> {
        Ok(Self {
            resource_labels: Some(
                serde_json::from_value(labels).map_err(Error::ResourceLabelsError)?,
            ),
            ..self
        })
    }

    /// Sets default labels to be applied in the labels field.
    ///
    /// These will populate the `labels` top level field of the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry).
    ///
    /// # Example
    ///
    /// ```
    /// use serde_json::json;
    /// let default_labels = json!(
    /// {
    ///     "application": "my-application",
    ///     "team": "my-team",
    ///     "environment": "production",
    /// });
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if `labels` is not an object of strings.
    #[must_use = "The builder must be used"]
    pub fn with_default_labels(self, labels: serde_json::Value) -> Result<Self, Error> {
        Ok(Self {
            default_labels: serde_json::from_value(labels).map_err(Error::DefaultLabelsError)?,
            ..self
        })
    }

    /// Sets the label name to store the log level
    ///
    /// If set, the log level value is added under this label the `labels` top level field of the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry)
    ///
    /// If not set, the log level is not propagated, but you will still have the [severity](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry#LogSeverity), which is always there.
    #[must_use = "The builder must be used"]
    pub fn with_log_level_label(self, log_level_label: &str) -> Self {
        Self {
            log_level_label: Some(log_level_label.into()),
            ..self
        }
    }

    /// Sets the project used to qualify trace ids.
    ///
    /// Defaults to the project in the log name when that has the `projects/{project}/logs/{id}` form.
    #[must_use = "The builder must be used"]
    pub fn with_project_id(self, project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..self
        }
    }

    /// Replaces circular references in key/value payloads by `"[Circular]"` instead of dropping
    /// the record.
    #[must_use = "The builder must be used"]
    pub fn with_remove_circular(self, remove_circular: bool) -> Self {
        Self {
            remove_circular,
            ..self
        }
    }

    /// This returns a tuple with a [`Logger`](struct@Logger), which can be passed to the slog root logger [as usual](https://docs.rs/slog/latest/slog/#where-to-start), and a [`std::sync::mpsc::Receiver`] channel.
    /// The `Logger` sends the [`WriteLogEntries`](https://cloud.google.com/logging/docs/reference/v2/rpc/google.logging.v2#google.logging.v2.LoggingServiceV2.WriteLogEntries) it creates to this channel.
    ///
    /// For instance you could output these to the console, if you have an external agent that reads the process' output and ships it to Cloud Logging.
    ///
    #[must_use = "The logger and receiver must be used to handle logging correctly"]
    pub fn build(self) -> (Logger, std::sync::mpsc::Receiver<WriteLogEntriesRequest>) {
        let (sync_tx, sync_rx) = sync_channel::<WriteLogEntriesRequest>(100);
        (self.into_logger(sync_tx), sync_rx)
    }

    /// In an async context this 'shipper' sends the log entries directly to the [Cloud Logging API](https://cloud.google.com/logging/docs/reference/v2/rest).
    ///
    /// # Example
    ///
    /// ```
    /// use tokio::runtime::Runtime;
    ///
    /// let rt = Runtime::new().unwrap();
    /// rt.spawn(async {
    ///   use cloudlog::logger::Builder;
    ///   let (drain, mut shipper) = Builder::new(
    ///       "projects/my-gcp-project/logs/my-log-id",
    ///       "k8s_container",
    ///   )
    ///   .build_with_async_shipper();
    ///
    ///   // Forward messages from the sync channel to the async channel where the
    ///   // shipper sends it to Cloud Logging
    ///   if let Some(bridge) = shipper.yield_bridge() {
    ///       tokio::task::spawn_blocking(move || {
    ///           bridge.run_sync_to_async_bridge();
    ///       });
    ///   }
    ///
    ///   tokio::spawn(async move {
    ///       shipper.run_log_shipper().await;
    ///   });
    /// });
    ///
    /// ```
    #[cfg(feature = "shipper")]
    #[must_use = "The logger and shipper must be used to handle logging correctly"]
    pub fn build_with_async_shipper(self) -> (Logger, shipper::Shipper) {
        let (sync_tx, sync_rx) = sync_channel::<WriteLogEntriesRequest>(100);
        (self.into_logger(sync_tx), shipper::Shipper::new(sync_rx))
    }

    fn into_logger(self, sync_tx: std::sync::mpsc::SyncSender<WriteLogEntriesRequest>) -> Logger {
        let project_id = self
            .project_id
            .or_else(|| project_from_log_name(&self.log_name))
            .unwrap_or_default();
        Logger {
            log_name: self.log_name,
            log_level_label: self.log_level_label,
            default_labels: self.default_labels,
            resource: MonitoredResource {
                type_: Some(self.resource_type),
                labels: self.resource_labels,
            },
            project_id,
            options: ToJsonOptions {
                remove_circular: self.remove_circular,
            },
            sync_tx,
        }
    }
}

fn project_from_log_name(log_name: &str) -> Option<String> {
    let rest = log_name.strip_prefix("projects/")?;
    let (project, rest) = rest.split_once('/')?;
    rest.starts_with("logs/").then(|| project.to_string())
}

impl Logger {
    fn construct_entry(&self, message: &str, log_level: Level, serializer: Serializer) -> Entry {
        let mut labels = self.default_labels.clone();

        // We add the log level to the labels if requested
        if let Some(label) = &self.log_level_label {
            labels.insert(label.clone(), log_level.as_str().to_string());
        }

        let data = serializer.payload;
        data.insert("message", message);

        let metadata = LogEntryMetadata {
            severity: Some(Severity::from(log_level)),
            labels: Some(labels),
            resource: Some(self.resource.clone()),
            trace: serializer.trace,
            span_id: serializer.span_id,
            trace_sampled: serializer.trace_sampled,
            http_request: serializer.http_request,
            ..Default::default()
        };
        Entry::new(metadata, data)
    }
}

// Collects the key/values of a record into the payload, lifting the trace fields out.
#[derive(Debug)]
struct Serializer {
    payload: ObjectRef,
    trace: Option<String>,
    span_id: Option<String>,
    trace_sampled: Option<bool>,
    http_request: Option<HttpRequest>,
}

impl Serializer {
    fn new() -> Self {
        Self {
            payload: ObjectRef::new(),
            trace: None,
            span_id: None,
            trace_sampled: None,
            http_request: None,
        }
    }

    fn put(&mut self, key: Key, value: Dynamic) {
        let key: &str = key.as_ref();
        match key {
            // The first non-empty value of a lifted key wins.
            "trace" if self.trace.is_none() => self.trace = non_empty(&value),
            "span_id" if self.span_id.is_none() => self.span_id = non_empty(&value),
            "trace_sampled" if self.trace_sampled.is_none() => {
                self.trace_sampled = match value {
                    Dynamic::Bool(sampled) => Some(sampled),
                    Dynamic::String(s) => s.parse().ok(),
                    _ => None,
                }
            }
            "http_request" if self.http_request.is_none() => {
                self.http_request = value.as_str().and_then(|s| serde_json::from_str(s).ok())
            }
            "trace" | "span_id" | "trace_sampled" | "http_request" => {}
            // Values of the record come first, those of the logger later. The first one wins.
            _ if self.payload.contains_key(key) => {}
            _ => {
                self.payload.insert(key, value);
            }
        }
    }
}

fn non_empty(value: &Dynamic) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl slog::Serializer for Serializer {
    fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
        let mut value = String::new();
        write!(value, "{val}")?;
        self.put(key, Dynamic::String(value));
        Ok(())
    }

    fn emit_str(&mut self, key: Key, val: &str) -> slog::Result {
        self.put(key, Dynamic::from(val));
        Ok(())
    }

    fn emit_bool(&mut self, key: Key, val: bool) -> slog::Result {
        self.put(key, Dynamic::Bool(val));
        Ok(())
    }

    fn emit_unit(&mut self, key: Key) -> slog::Result {
        self.put(key, Dynamic::Null);
        Ok(())
    }

    fn emit_none(&mut self, key: Key) -> slog::Result {
        self.put(key, Dynamic::Null);
        Ok(())
    }

    fn emit_u8(&mut self, key: Key, val: u8) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_u16(&mut self, key: Key, val: u16) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_u32(&mut self, key: Key, val: u32) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_u64(&mut self, key: Key, val: u64) -> slog::Result {
        self.put(key, Dynamic::Number(val as f64));
        Ok(())
    }

    fn emit_usize(&mut self, key: Key, val: usize) -> slog::Result {
        self.put(key, Dynamic::Number(val as f64));
        Ok(())
    }

    fn emit_i8(&mut self, key: Key, val: i8) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_i16(&mut self, key: Key, val: i16) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_i32(&mut self, key: Key, val: i32) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_i64(&mut self, key: Key, val: i64) -> slog::Result {
        self.put(key, Dynamic::Number(val as f64));
        Ok(())
    }

    fn emit_isize(&mut self, key: Key, val: isize) -> slog::Result {
        self.put(key, Dynamic::Number(val as f64));
        Ok(())
    }

    fn emit_f32(&mut self, key: Key, val: f32) -> slog::Result {
        self.put(key, Dynamic::Number(val.into()));
        Ok(())
    }

    fn emit_f64(&mut self, key: Key, val: f64) -> slog::Result {
        self.put(key, Dynamic::Number(val));
        Ok(())
    }
}

impl Drain for Logger {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let mut serializer = Serializer::new();

        let kv = record.kv();
        let _ = kv.serialize(record, &mut serializer);

        let _ = values.serialize(record, &mut serializer);

        let entry = self.construct_entry(
            format!("{}", record.msg()).as_str(),
            record.level(),
            serializer,
        );

        let log_entry = match entry.to_api_entry(&self.options, &self.project_id) {
            Ok(log_entry) => log_entry,
            Err(e) => {
                eprintln!("Failed to construct log entry, not sent to Cloud Logging: {}", e);
                return Ok(());
            }
        };

        let body = WriteLogEntriesRequest {
            log_name: Some(self.log_name.clone()),
            entries: Some(vec![log_entry]),
            ..Default::default()
        };

        let _ = self.sync_tx.send(body);

        Ok(())
    }
}
