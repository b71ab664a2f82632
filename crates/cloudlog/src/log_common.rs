use crate::entry::Entry;
use crate::severity::Severity;

use google_logging2::api::MonitoredResource;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;

// Everything but the characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Options applied to every entry of a write.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub labels: Option<HashMap<String, String>>,
    pub resource: Option<MonitoredResource>,
}

/// Formats the full name of a log: `projects/{project_id}/logs/{name}`.
///
/// `name` may already be a full name of the same project. The log id is percent-encoded unless it
/// already is.
pub fn format_log_name(project_id: &str, name: &str) -> String {
    let path = format!("projects/{project_id}/logs/");
    let name = name.replacen(&path, "", 1);
    let already_encoded = percent_decode_str(&name)
        .decode_utf8()
        .map_or(false, |decoded| decoded != name);
    if already_encoded {
        format!("{path}{name}")
    } else {
        format!("{path}{}", utf8_percent_encode(&name, COMPONENT))
    }
}

/// Turns camelCase label keys into snake_case ones, e.g. `podName` into `pod_name`.
pub fn snakecase_keys(labels: HashMap<String, String>) -> HashMap<String, String> {
    labels
        .into_iter()
        .map(|(key, value)| (snakecase(&key), value))
        .collect()
}

fn snakecase(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Returns the entries with `severity` set, leaving the originals untouched.
pub fn assign_severity_to_entries(entries: &[Entry], severity: Severity) -> Vec<Entry> {
    entries
        .iter()
        .map(|entry| {
            let mut entry = entry.clone();
            entry.metadata.severity = Some(severity);
            entry
        })
        .collect()
}
