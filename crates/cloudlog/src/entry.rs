//! Log entries and their wire forms.
//!
//! An [`Entry`] is a payload plus [metadata](LogEntryMetadata). It can be rendered in three ways:
//!
//! * [`Entry::to_json`]: the gRPC shaped form, with an object payload encoded as a `Struct`.
//! * [`Entry::to_api_entry`]: the [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry)
//!   of the REST API, ready to be placed in a `WriteLogEntriesRequest`.
//! * [`Entry::to_structured_json`]: the [structured logging](https://cloud.google.com/logging/docs/structured-logging)
//!   format picked up by logging agents from stdout.

use crate::context::{self, TraceContext};
use crate::error::{Error, Result};
use crate::http_request::HttpRequest;
use crate::severity::Severity;
use crate::structs::{obj_to_struct, struct_to_obj, ConversionOptions, Dynamic, StructObject};

use chrono::{DateTime, SecondsFormat, Utc};
use google_logging2::api::{LogEntry, MonitoredResource};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub const INSERT_ID_KEY: &str = "logging.googleapis.com/insertId";
pub const LABELS_KEY: &str = "logging.googleapis.com/labels";
pub const OPERATION_KEY: &str = "logging.googleapis.com/operation";
pub const SOURCE_LOCATION_KEY: &str = "logging.googleapis.com/sourceLocation";
pub const SPAN_ID_KEY: &str = "logging.googleapis.com/spanId";
pub const TRACE_KEY: &str = "logging.googleapis.com/trace";
pub const TRACE_SAMPLED_KEY: &str = "logging.googleapis.com/trace_sampled";

/// Everything about a log entry except its payload.
#[derive(Clone, Debug, Default)]
pub struct LogEntryMetadata {
    pub timestamp: Option<DateTime<Utc>>,
    pub insert_id: Option<String>,
    pub severity: Option<Severity>,
    pub labels: Option<HashMap<String, String>>,
    pub resource: Option<MonitoredResource>,
    pub log_name: Option<String>,
    pub http_request: Option<HttpRequest>,
    pub trace: Option<String>,
    pub span_id: Option<String>,
    pub trace_sampled: Option<bool>,
    pub operation: Option<Value>,
    pub source_location: Option<Value>,
    /// Headers of the request this entry is about. When set, the trace context is detected from
    /// them for any trace field the metadata does not set itself.
    pub request_headers: Option<http::HeaderMap>,
}

/// A protobuf `Timestamp` in its object form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

/// The gRPC shaped form of an entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<MonitoredResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_payload: Option<StructObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_sampled: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ToJsonOptions {
    pub remove_circular: bool,
}

/// A log entry: metadata and a payload.
///
/// Object payloads become a `jsonPayload`, string payloads a `textPayload`.
#[derive(Clone, Debug)]
pub struct Entry {
    pub metadata: LogEntryMetadata,
    pub data: Dynamic,
}

impl Entry {
    /// Creates an entry, defaulting the timestamp to now and the insert id to a new event id.
    ///
    /// The Logging API doesn't guarantee to preserve insertion order for entries with the same
    /// timestamp, but uses the `insertId` as a secondary ordering. Event ids increase monotonically
    /// within the process.
    pub fn new<D: Into<Dynamic>>(mut metadata: LogEntryMetadata, data: D) -> Self {
        metadata.timestamp.get_or_insert_with(Utc::now);
        metadata.insert_id.get_or_insert_with(next_event_id);
        Entry {
            metadata,
            data: data.into(),
        }
    }

    /// Renders the gRPC shaped form. Object payloads are converted with `stringify` on, so values
    /// without a wire form do not fail the entry.
    ///
    /// # Errors
    ///
    /// [`Error::CircularReference`] when the payload is circular and `remove_circular` is off.
    pub fn to_json(&self, options: &ToJsonOptions, project_id: &str) -> Result<EntryJson> {
        let meta = &self.metadata;
        let mut entry = EntryJson {
            log_name: meta.log_name.clone(),
            resource: meta.resource.clone(),
            timestamp: meta.timestamp.map(Timestamp::from),
            severity: meta.severity,
            insert_id: meta.insert_id.clone(),
            labels: meta.labels.clone(),
            http_request: meta.http_request.clone(),
            trace: meta.trace.clone(),
            span_id: meta.span_id.clone(),
            trace_sampled: meta.trace_sampled,
            ..Default::default()
        };

        match &self.data {
            Dynamic::Object(obj) => {
                entry.json_payload = Some(obj_to_struct(
                    obj,
                    ConversionOptions {
                        remove_circular: options.remove_circular,
                        stringify: true,
                    },
                )?)
            }
            Dynamic::String(s) => entry.text_payload = Some(s.clone()),
            _ => {}
        }

        if let Some(ctx) = self.extract_trace_context(project_id) {
            if is_blank(&meta.trace) && !ctx.trace.is_empty() {
                entry.trace = Some(ctx.trace);
            }
            if is_blank(&meta.span_id) && ctx.span_id.is_some() {
                entry.span_id = ctx.span_id;
            }
            if meta.trace_sampled.is_none() {
                entry.trace_sampled = ctx.trace_sampled;
            }
        }

        Ok(entry)
    }

    /// Renders the REST API `LogEntry`. The object payload goes through the `Struct` conversion and
    /// back, which replaces circular references and values without a JSON form.
    ///
    /// # Errors
    ///
    /// Those of [`to_json`](Entry::to_json), and [`Error::ApiEntryError`] when the result does not
    /// fit the API types.
    pub fn to_api_entry(&self, options: &ToJsonOptions, project_id: &str) -> Result<LogEntry> {
        let json = self.to_json(options, project_id)?;
        let mut entry = Map::new();

        if let Some(log_name) = json.log_name {
            entry.insert("logName".into(), log_name.into());
        }
        if let Some(resource) = json.resource {
            entry.insert(
                "resource".into(),
                serde_json::to_value(resource).map_err(Error::ApiEntryError)?,
            );
        }
        if let Some(ts) = json.timestamp.and_then(|ts| ts.to_datetime()) {
            entry.insert(
                "timestamp".into(),
                ts.to_rfc3339_opts(SecondsFormat::Nanos, true).into(),
            );
        }
        if let Some(severity) = json.severity {
            entry.insert("severity".into(), severity.as_str().into());
        }
        if let Some(insert_id) = json.insert_id {
            entry.insert("insertId".into(), insert_id.into());
        }
        if let Some(labels) = json.labels {
            entry.insert(
                "labels".into(),
                serde_json::to_value(labels).map_err(Error::ApiEntryError)?,
            );
        }
        if let Some(http_request) = json.http_request {
            entry.insert("httpRequest".into(), http_request.to_api_json());
        }
        if let Some(payload) = json.json_payload {
            entry.insert(
                "jsonPayload".into(),
                Value::Object(struct_to_obj(&payload).to_json()),
            );
        }
        if let Some(text) = json.text_payload {
            entry.insert("textPayload".into(), text.into());
        }
        if let Some(trace) = json.trace {
            entry.insert("trace".into(), trace.into());
        }
        if let Some(span_id) = json.span_id {
            entry.insert("spanId".into(), span_id.into());
        }
        if let Some(sampled) = json.trace_sampled {
            entry.insert("traceSampled".into(), sampled.into());
        }

        serde_json::from_value(Value::Object(entry)).map_err(Error::ApiEntryError)
    }

    /// Renders the structured logging format understood by logging agents.
    ///
    /// With `use_message_field` the payload goes under `message`. Without it an object payload is
    /// merged into the top level and anything else still becomes the `message`.
    pub fn to_structured_json(&self, project_id: &str, use_message_field: bool) -> Map<String, Value> {
        let meta = &self.metadata;
        let mut entry = Map::new();

        if let Some(log_name) = &meta.log_name {
            entry.insert("logName".into(), log_name.clone().into());
        }
        if let Some(resource) = &meta.resource {
            if let Ok(resource) = serde_json::to_value(resource) {
                entry.insert("resource".into(), resource);
            }
        }
        if let Some(severity) = meta.severity {
            entry.insert("severity".into(), severity.as_str().into());
        }
        if let Some(ts) = meta.timestamp {
            entry.insert("timestamp".into(), timestamp_value(Timestamp::from(ts)));
        }
        if let Some(http_request) = &meta.http_request {
            if let Ok(http_request) = serde_json::to_value(http_request) {
                entry.insert("httpRequest".into(), http_request);
            }
        }
        if let Some(labels) = &meta.labels {
            let labels = labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            entry.insert(LABELS_KEY.into(), Value::Object(labels));
        }
        if let Some(insert_id) = meta.insert_id.as_ref().filter(|id| !id.is_empty()) {
            entry.insert(INSERT_ID_KEY.into(), insert_id.clone().into());
        }
        if let Some(operation) = &meta.operation {
            entry.insert(OPERATION_KEY.into(), operation.clone());
        }
        if let Some(source_location) = &meta.source_location {
            entry.insert(SOURCE_LOCATION_KEY.into(), source_location.clone());
        }
        if let Some(trace) = meta.trace.as_ref().filter(|t| !t.is_empty()) {
            entry.insert(TRACE_KEY.into(), trace.clone().into());
        }
        if let Some(span_id) = meta.span_id.as_ref().filter(|s| !s.is_empty()) {
            entry.insert(SPAN_ID_KEY.into(), span_id.clone().into());
        }
        if let Some(sampled) = meta.trace_sampled {
            entry.insert(TRACE_SAMPLED_KEY.into(), sampled.into());
        }

        match &self.data {
            Dynamic::Undefined | Dynamic::Null => {}
            Dynamic::String(s) if s.is_empty() => {}
            Dynamic::String(s) => {
                entry.insert("message".into(), s.clone().into());
            }
            data if use_message_field => {
                entry.insert("message".into(), data.to_json());
            }
            Dynamic::Object(obj) => entry.extend(obj.to_json()),
            data => {
                entry.insert("message".into(), data.to_json().to_string().into());
            }
        }

        if let Some(ctx) = self.extract_trace_context(project_id) {
            if !entry.contains_key(TRACE_KEY) && !ctx.trace.is_empty() {
                entry.insert(TRACE_KEY.into(), ctx.trace.into());
            }
            if !entry.contains_key(SPAN_ID_KEY) {
                if let Some(span_id) = ctx.span_id {
                    entry.insert(SPAN_ID_KEY.into(), span_id.into());
                }
            }
            if !entry.contains_key(TRACE_SAMPLED_KEY) {
                if let Some(sampled) = ctx.trace_sampled {
                    entry.insert(TRACE_SAMPLED_KEY.into(), sampled.into());
                }
            }
        }

        entry
    }

    /// Restores an entry from the gRPC shaped form returned by the API.
    pub fn from_api_response(entry: EntryJson) -> Self {
        let data = match (entry.json_payload, entry.text_payload) {
            (Some(payload), _) => Dynamic::Object(struct_to_obj(&payload)),
            (None, Some(text)) => Dynamic::String(text),
            (None, None) => Dynamic::Undefined,
        };
        let metadata = LogEntryMetadata {
            timestamp: entry.timestamp.and_then(|ts| ts.to_datetime()),
            insert_id: entry.insert_id,
            severity: entry.severity,
            labels: entry.labels,
            resource: entry.resource,
            log_name: entry.log_name,
            http_request: entry.http_request,
            trace: entry.trace,
            span_id: entry.span_id,
            trace_sampled: entry.trace_sampled,
            ..Default::default()
        };
        Entry::new(metadata, data)
    }

    // Detects the trace context from the request headers, never injecting one.
    fn extract_trace_context(&self, project_id: &str) -> Option<TraceContext> {
        let mut headers = self.metadata.request_headers.clone()?;
        Some(context::get_or_inject_context(
            Some(&mut headers),
            project_id,
            false,
        ))
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

fn timestamp_value(ts: Timestamp) -> Value {
    serde_json::json!({"seconds": ts.seconds, "nanos": ts.nanos})
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }
}

impl Timestamp {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanos)
    }
}

/// Converts an RFC3339 "Zulu" timestamp like `2021-01-01T00:00:00.123456789Z` to a [`Timestamp`],
/// keeping nanosecond precision. Unparsable input gives the zero timestamp.
pub fn zulu_to_timestamp(zulu_time: &str) -> Timestamp {
    DateTime::parse_from_rfc3339(zulu_time)
        .map(|dt| Timestamp::from(dt.with_timezone(&Utc)))
        .unwrap_or_default()
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);
static EVENT_PREFIX: OnceLock<String> = OnceLock::new();

// A random per process prefix followed by a zero padded counter, so ids sort in creation order.
fn next_event_id() -> String {
    let prefix = EVENT_PREFIX.get_or_init(|| format!("{:08x}", rand::thread_rng().gen::<u32>()));
    let count = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{count:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{DynamicValue, ObjectRef};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> ObjectRef {
        match value {
            Value::Object(map) => ObjectRef::from(map),
            _ => panic!("not an object"),
        }
    }

    fn traced_headers() -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-cloud-trace-context",
            "105445aa7843bc8bf206b120001000/000000001;o=1".parse().unwrap(),
        );
        headers
    }

    #[test]
    fn new_entries_get_a_timestamp_and_increasing_insert_ids() {
        let first = Entry::new(LogEntryMetadata::default(), "a");
        let second = Entry::new(LogEntryMetadata::default(), "b");
        assert!(first.metadata.timestamp.is_some());
        assert!(first.metadata.insert_id < second.metadata.insert_id);
    }

    #[test]
    fn object_data_becomes_a_json_payload() {
        let entry = Entry::new(LogEntryMetadata::default(), object(json!({"a": 1})));
        let json = entry.to_json(&ToJsonOptions::default(), "p").unwrap();
        assert_eq!(
            json.json_payload.unwrap().fields["a"],
            DynamicValue::NumberValue(1.0)
        );
        assert_eq!(json.text_payload, None);
    }

    #[test]
    fn string_data_becomes_a_text_payload() {
        let entry = Entry::new(LogEntryMetadata::default(), "hello");
        let json = entry.to_json(&ToJsonOptions::default(), "p").unwrap();
        assert_eq!(json.text_payload, Some("hello".to_string()));
        assert!(json.json_payload.is_none());
    }

    #[test]
    fn circular_payloads_follow_the_option() {
        let obj = object(json!({"a": "b"}));
        obj.insert("me", obj.clone());
        let entry = Entry::new(LogEntryMetadata::default(), obj.clone());

        let strict = entry.to_json(&ToJsonOptions::default(), "p");
        let lenient = entry.to_json(
            &ToJsonOptions {
                remove_circular: true,
            },
            "p",
        );
        obj.clear();

        assert!(matches!(strict, Err(Error::CircularReference)));
        assert_eq!(
            lenient.unwrap().json_payload.unwrap().fields["me"],
            DynamicValue::StringValue("[Circular]".to_string())
        );
    }

    #[test]
    fn trace_context_comes_from_request_headers() {
        let metadata = LogEntryMetadata {
            request_headers: Some(traced_headers()),
            ..Default::default()
        };
        let json = Entry::new(metadata, "x")
            .to_json(&ToJsonOptions::default(), "my-project")
            .unwrap();
        assert_eq!(
            json.trace.as_deref(),
            Some("projects/my-project/traces/105445aa7843bc8bf206b120001000")
        );
        assert_eq!(json.span_id.as_deref(), Some("000000001"));
        assert_eq!(json.trace_sampled, Some(true));
    }

    #[test]
    fn explicit_trace_fields_win_over_headers() {
        let metadata = LogEntryMetadata {
            trace: Some("projects/p/traces/mine".to_string()),
            trace_sampled: Some(false),
            request_headers: Some(traced_headers()),
            ..Default::default()
        };
        let json = Entry::new(metadata, "x")
            .to_json(&ToJsonOptions::default(), "p")
            .unwrap();
        assert_eq!(json.trace.as_deref(), Some("projects/p/traces/mine"));
        assert_eq!(json.span_id.as_deref(), Some("000000001"));
        assert_eq!(json.trace_sampled, Some(false));
    }

    #[test]
    fn structured_json_uses_special_keys() {
        let metadata = LogEntryMetadata {
            severity: Some(Severity::Warning),
            labels: Some(HashMap::from([("team".to_string(), "core".to_string())])),
            insert_id: Some("id-1".to_string()),
            timestamp: DateTime::from_timestamp(10, 5),
            request_headers: Some(traced_headers()),
            ..Default::default()
        };
        let structured = Entry::new(metadata, "hello").to_structured_json("p", true);

        assert_eq!(
            Value::Object(structured),
            json!({
                "severity": "WARNING",
                "timestamp": {"seconds": 10, "nanos": 5},
                "message": "hello",
                LABELS_KEY: {"team": "core"},
                INSERT_ID_KEY: "id-1",
                TRACE_KEY: "projects/p/traces/105445aa7843bc8bf206b120001000",
                SPAN_ID_KEY: "000000001",
                TRACE_SAMPLED_KEY: true,
            })
        );
    }

    #[test]
    fn structured_json_can_merge_object_payloads() {
        let entry = Entry::new(
            LogEntryMetadata {
                timestamp: DateTime::from_timestamp(0, 0),
                insert_id: Some(String::new()),
                ..Default::default()
            },
            object(json!({"component": "relay", "count": 2})),
        );
        assert_eq!(
            Value::Object(entry.to_structured_json("p", false)),
            json!({
                "timestamp": {"seconds": 0, "nanos": 0},
                "component": "relay",
                "count": 2,
            })
        );
        assert_eq!(
            entry.to_structured_json("p", true)["message"],
            json!({"component": "relay", "count": 2})
        );
    }

    #[test]
    fn api_entry_carries_plain_json_payload() {
        let metadata = LogEntryMetadata {
            severity: Some(Severity::Error),
            log_name: Some("projects/p/logs/relay".to_string()),
            ..Default::default()
        };
        let api = Entry::new(metadata, object(json!({"a": {"b": [1, true]}})))
            .to_api_entry(&ToJsonOptions::default(), "p")
            .unwrap();

        assert_eq!(api.severity.as_deref(), Some("ERROR"));
        assert_eq!(api.log_name.as_deref(), Some("projects/p/logs/relay"));
        let payload = api.json_payload.unwrap();
        assert_eq!(payload["a"], json!({"b": [1, true]}));
        assert!(api.timestamp.is_some());
    }

    #[test]
    fn restores_entries_from_api_responses() {
        let api_entry = EntryJson {
            json_payload: Some(StructObject::from_json_str(
                r#"{"fields": {"name": {"stringValue": "Stephen"}}}"#,
            )
            .unwrap()),
            timestamp: Some(Timestamp {
                seconds: 1_600_000_000,
                nanos: 250_000_000,
            }),
            ..Default::default()
        };

        let entry = Entry::from_api_response(api_entry);

        assert_eq!(
            entry.data.as_object().unwrap().get("name"),
            Some(Dynamic::from("Stephen"))
        );
        assert_eq!(
            entry.metadata.timestamp.map(Timestamp::from),
            Some(Timestamp {
                seconds: 1_600_000_000,
                nanos: 250_000_000
            })
        );
    }

    #[test]
    fn parses_zulu_timestamps() {
        assert_eq!(
            zulu_to_timestamp("2021-01-01T00:00:00.123456789Z"),
            Timestamp {
                seconds: 1_609_459_200,
                nanos: 123_456_789
            }
        );
        assert_eq!(zulu_to_timestamp("yesterday"), Timestamp::default());
    }
}
