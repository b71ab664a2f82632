//! Extracts the trace, span and sampling decision of a request from its HTTP headers.
//!
//! Two header formats are understood, tried in this order:
//!
//! 1. The W3C [`traceparent`](https://www.w3.org/TR/trace-context/) header.
//! 2. Google's `X-Cloud-Trace-Context` header, formatted as `TRACE_ID/SPAN_ID;o=TRACE_TRUE`.
//!
//! When neither is present [`get_or_inject_context`] can optionally generate a new Google trace
//! context and write it back into the request, so that everything downstream sees the same trace.
//!
//! Parsing is best effort: malformed headers never produce errors, they simply do not match.

use rand::Rng;
use std::collections::HashMap;
use std::fmt;

/// Header that carries span context across Google infrastructure.
pub const X_CLOUD_TRACE_HEADER: &str = "x-cloud-trace-context";

/// Header that carries span context across W3C compliant infrastructure.
pub const W3C_TRACE_PARENT_HEADER: &str = "traceparent";

/// Cloud Logging compliant trace context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// Either empty or of the form `projects/{project_id}/traces/{trace_id}` once qualified.
    pub trace: String,
    pub span_id: Option<String>,
    pub trace_sampled: Option<bool>,
}

/// The value(s) of a header as stored by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// A transport and environment neutral API for getting and setting request headers.
pub trait HeaderAccessor {
    fn get_header(&self, name: &str) -> Option<HeaderValues>;
    fn set_header(&mut self, name: &str, value: &str);
}

impl fmt::Display for HeaderValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValues::One(value) => f.write_str(value),
            HeaderValues::Many(values) => f.write_str(&values.join(",")),
        }
    }
}

impl HeaderAccessor for http::HeaderMap {
    fn get_header(&self, name: &str) -> Option<HeaderValues> {
        let mut values: Vec<String> = self
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        match values.len() {
            0 => None,
            1 => values.pop().map(HeaderValues::One),
            _ => Some(HeaderValues::Many(values)),
        }
    }

    fn set_header(&mut self, name: &str, value: &str) {
        // Invalid names or values are dropped, tracing must not break the request.
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            self.insert(name, value);
        }
    }
}

impl HeaderAccessor for HashMap<String, HeaderValues> {
    fn get_header(&self, name: &str) -> Option<HeaderValues> {
        self.get(name).cloned()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.insert(name.to_string(), HeaderValues::One(value.to_string()));
    }
}

/// Returns a trace context with as many trace and span properties as the headers offer.
///
/// A `None` accessor, i.e. a request without headers, yields the empty default context. When no
/// trace header is found and `inject` is set, a new `X-Cloud-Trace-Context` header is generated,
/// written to the request and returned. That is the only path that modifies the request.
pub fn get_or_inject_context<H>(
    headers: Option<&mut H>,
    project_id: &str,
    inject: bool,
) -> TraceContext
where
    H: HeaderAccessor + ?Sized,
{
    let Some(headers) = headers else {
        return TraceContext::default();
    };

    if let Some(context) = get_context_from_trace_parent(&*headers, project_id) {
        return context;
    }
    if let Some(context) = get_context_from_x_cloud_trace(&*headers, project_id) {
        return context;
    }
    if inject {
        headers.set_header(X_CLOUD_TRACE_HEADER, &make_cloud_trace_header());
        if let Some(context) = get_context_from_x_cloud_trace(&*headers, project_id) {
            return context;
        }
    }
    TraceContext::default()
}

/// Looks for the `traceparent` header and qualifies the trace with the project.
pub fn get_context_from_trace_parent<H>(headers: &H, project_id: &str) -> Option<TraceContext>
where
    H: HeaderAccessor + ?Sized,
{
    parse_trace_parent_header(headers).map(|context| to_cloud_trace_context(context, project_id))
}

/// Looks for the `x-cloud-trace-context` header and qualifies the trace with the project.
pub fn get_context_from_x_cloud_trace<H>(headers: &H, project_id: &str) -> Option<TraceContext>
where
    H: HeaderAccessor + ?Sized,
{
    parse_x_cloud_trace_header(headers).map(|context| to_cloud_trace_context(context, project_id))
}

// Rewrites the raw trace id to its fully qualified form. Empty ids stay empty.
fn to_cloud_trace_context(raw: TraceContext, project_id: &str) -> TraceContext {
    TraceContext {
        trace: if raw.trace.is_empty() {
            String::new()
        } else {
            format!("projects/{}/traces/{}", project_id, raw.trace)
        },
        span_id: raw.span_id.filter(|s| !s.is_empty()),
        trace_sampled: raw.trace_sampled,
    }
}

/// Generates a valid `X-Cloud-Trace-Context` value with a random trace and span id, sampled.
pub fn make_cloud_trace_header() -> String {
    let trace = uuid::Uuid::new_v4().simple().to_string();
    let span_bytes: [u8; 8] = rand::thread_rng().gen();
    let span_id: String = span_bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{trace}/{span_id};o=1")
}

/// Parses the `x-cloud-trace-context` header.
///
/// The format `TRACE_ID[/SPAN_ID][;o=TRACE_TRUE]` is matched permissively as a prefix: every part is
/// optional, so a present header always yields a context, possibly with an empty trace. Only an
/// absent header yields `None`.
pub fn parse_x_cloud_trace_header<H>(headers: &H) -> Option<TraceContext>
where
    H: HeaderAccessor + ?Sized,
{
    let value = headers.get_header(X_CLOUD_TRACE_HEADER)?.to_string();
    let mut rest = value.as_str();

    let trace = take_hex(&mut rest);

    let mut span_id = None;
    if let Some(after_slash) = rest.strip_prefix('/') {
        let mut candidate = after_slash;
        let span = take_hex(&mut candidate);
        if !span.is_empty() {
            span_id = Some(span.to_string());
            rest = candidate;
        }
    }

    let trace_sampled = {
        let options = rest.strip_prefix(';').unwrap_or(rest);
        options
            .strip_prefix("o=")
            .and_then(|flag| flag.chars().next())
            .filter(char::is_ascii_digit)
            == Some('1')
    };

    Some(TraceContext {
        trace: trace.to_string(),
        span_id,
        trace_sampled: Some(trace_sampled),
    })
}

/// Parses the W3C `traceparent` header: `VERSION-TRACE_ID-PARENT_ID-FLAGS[-...]`.
///
/// All parts are lowercase hex. The version may not be `ff`, trace and parent ids may not be all
/// zeros. Trailing parts are allowed for forward compatibility, except with version `00`.
pub fn parse_trace_parent_header<H>(headers: &H) -> Option<TraceContext>
where
    H: HeaderAccessor + ?Sized,
{
    let value = headers.get_header(W3C_TRACE_PARENT_HEADER)?.to_string();
    let mut rest = strip_one(value.as_str(), |c| c.is_whitespace(), true);

    let version = take_hex_part(&mut rest, 2)?;
    expect_dash(&mut rest)?;
    let trace_id = take_hex_part(&mut rest, 32)?;
    expect_dash(&mut rest)?;
    let parent_id = take_hex_part(&mut rest, 16)?;
    expect_dash(&mut rest)?;
    let flags = take_hex_part(&mut rest, 2)?;

    if version == "ff" || all_zeros(trace_id) || all_zeros(parent_id) {
        return None;
    }

    let rest = strip_one(rest, |c| c.is_whitespace(), false);
    if !rest.is_empty() {
        let suffix = rest.strip_prefix('-')?;
        if suffix.contains(is_line_terminator) {
            return None;
        }
        // Trace Context asks implementations to be compatible with future
        // versions. If there are more parts, we only reject it if it's using version 00.
        // See https://www.w3.org/TR/trace-context/#versioning-of-traceparent
        if version == "00" {
            return None;
        }
    }

    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some(TraceContext {
        trace: trace_id.to_string(),
        span_id: Some(parent_id.to_string()),
        trace_sampled: Some(flags & 0x1 == 1),
    })
}

fn is_lower_hex(c: char) -> bool {
    c.is_ascii_digit() || ('a'..='f').contains(&c)
}

fn is_line_terminator(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}')
}

fn all_zeros(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}

// Consumes the longest run of lowercase hex digits.
fn take_hex<'a>(rest: &mut &'a str) -> &'a str {
    let end = rest.find(|c: char| !is_lower_hex(c)).unwrap_or(rest.len());
    let (hex, remainder) = rest.split_at(end);
    *rest = remainder;
    hex
}

// Consumes exactly `len` lowercase hex digits.
fn take_hex_part<'a>(rest: &mut &'a str, len: usize) -> Option<&'a str> {
    let part = rest.get(..len)?;
    if !part.chars().all(is_lower_hex) {
        return None;
    }
    *rest = &rest[len..];
    Some(part)
}

fn expect_dash(rest: &mut &str) -> Option<()> {
    *rest = rest.strip_prefix('-')?;
    Some(())
}

// Removes at most one matching char from the start or, with `leading == false`, the end.
fn strip_one(s: &str, pred: impl Fn(char) -> bool, leading: bool) -> &str {
    if leading {
        match s.chars().next() {
            Some(c) if pred(c) => &s[c.len_utf8()..],
            _ => s,
        }
    } else {
        match s.chars().next_back() {
            Some(c) if pred(c) => &s[..s.len() - c.len_utf8()],
            _ => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, HeaderValues> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), HeaderValues::One(v.to_string())))
            .collect()
    }

    fn trace_parent(value: &str) -> Option<TraceContext> {
        parse_trace_parent_header(&headers(&[(W3C_TRACE_PARENT_HEADER, value)]))
    }

    fn x_cloud_trace(value: &str) -> Option<TraceContext> {
        parse_x_cloud_trace_header(&headers(&[(X_CLOUD_TRACE_HEADER, value)]))
    }

    #[test]
    fn parses_a_valid_traceparent() {
        assert_eq!(
            trace_parent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            Some(TraceContext {
                trace: "0af7651916cd43dd8448eb211c80319c".to_string(),
                span_id: Some("b7ad6b7169203331".to_string()),
                trace_sampled: Some(true),
            })
        );
    }

    #[test]
    fn traceparent_sampling_uses_the_lowest_flag_bit() {
        let unsampled = trace_parent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00");
        assert_eq!(unsampled.unwrap().trace_sampled, Some(false));
        let odd = trace_parent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-03");
        assert_eq!(odd.unwrap().trace_sampled, Some(true));
    }

    #[test]
    fn rejects_malformed_traceparents() {
        for value in [
            "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
            "0-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "nonsense",
        ] {
            assert_eq!(trace_parent(value), None, "{value}");
        }
    }

    #[test]
    fn future_traceparent_versions_may_have_more_parts() {
        let context = trace_parent("01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-what")
            .unwrap();
        assert_eq!(context.trace, "0af7651916cd43dd8448eb211c80319c");
    }

    #[test]
    fn traceparent_tolerates_surrounding_whitespace() {
        assert!(trace_parent(" 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01 ").is_some());
    }

    #[test]
    fn parses_a_full_x_cloud_trace_header() {
        assert_eq!(
            x_cloud_trace("105445aa7843bc8bf206b120001000/000000001;o=1"),
            Some(TraceContext {
                trace: "105445aa7843bc8bf206b120001000".to_string(),
                span_id: Some("000000001".to_string()),
                trace_sampled: Some(true),
            })
        );
    }

    #[test]
    fn x_cloud_trace_parts_are_optional() {
        assert_eq!(
            x_cloud_trace("105445aa7843bc8bf206b120001000"),
            Some(TraceContext {
                trace: "105445aa7843bc8bf206b120001000".to_string(),
                span_id: None,
                trace_sampled: Some(false),
            })
        );
        assert_eq!(
            x_cloud_trace("105445aa7843bc8bf206b120001000/000000001;o=0")
                .unwrap()
                .trace_sampled,
            Some(false)
        );
        assert_eq!(x_cloud_trace("abc/;o=1").unwrap().span_id, None);
    }

    #[test]
    fn absent_x_cloud_trace_header_does_not_match() {
        assert_eq!(parse_x_cloud_trace_header(&headers(&[])), None);
    }

    #[test]
    fn multiple_header_values_are_joined() {
        let mut map = HashMap::new();
        map.insert(
            X_CLOUD_TRACE_HEADER.to_string(),
            HeaderValues::Many(vec!["abc/123".to_string(), "def".to_string()]),
        );
        let context = parse_x_cloud_trace_header(&map).unwrap();
        assert_eq!(context.trace, "abc");
        assert_eq!(context.span_id, Some("123".to_string()));
    }

    #[test]
    fn traceparent_takes_priority() {
        let mut map = headers(&[
            (W3C_TRACE_PARENT_HEADER, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            (X_CLOUD_TRACE_HEADER, "105445aa7843bc8bf206b120001000/000000001;o=0"),
        ]);
        let context = get_or_inject_context(Some(&mut map), "my-project", false);
        assert_eq!(
            context.trace,
            "projects/my-project/traces/0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(context.span_id, Some("b7ad6b7169203331".to_string()));
    }

    #[test]
    fn falls_back_to_x_cloud_trace() {
        let mut map = headers(&[
            (W3C_TRACE_PARENT_HEADER, "garbage"),
            (X_CLOUD_TRACE_HEADER, "105445aa7843bc8bf206b120001000/000000001;o=1"),
        ]);
        let context = get_or_inject_context(Some(&mut map), "my-project", false);
        assert_eq!(
            context,
            TraceContext {
                trace: "projects/my-project/traces/105445aa7843bc8bf206b120001000".to_string(),
                span_id: Some("000000001".to_string()),
                trace_sampled: Some(true),
            }
        );
    }

    #[test]
    fn no_headers_and_no_injection_gives_the_default() {
        let mut map = headers(&[]);
        assert_eq!(
            get_or_inject_context(Some(&mut map), "my-project", false),
            TraceContext {
                trace: String::new(),
                span_id: None,
                trace_sampled: None,
            }
        );
        assert!(map.is_empty());
    }

    #[test]
    fn missing_header_accessor_gives_the_default() {
        let context =
            get_or_inject_context(None::<&mut HashMap<String, HeaderValues>>, "my-project", true);
        assert_eq!(context, TraceContext::default());
    }

    #[test]
    fn injects_a_consistent_context() {
        let mut map = http::HeaderMap::new();
        let context = get_or_inject_context(Some(&mut map), "my-project", true);

        assert!(context.trace.starts_with("projects/my-project/traces/"));
        let span_id = context.span_id.clone().unwrap();
        assert_eq!(span_id.len(), 16);
        assert_eq!(context.trace_sampled, Some(true));

        let written = map.get(X_CLOUD_TRACE_HEADER).unwrap().to_str().unwrap();
        let trace_id = context.trace.trim_start_matches("projects/my-project/traces/");
        assert_eq!(trace_id.len(), 32);
        assert_eq!(written, format!("{trace_id}/{span_id};o=1"));
    }

    #[test]
    fn generated_headers_differ() {
        assert_ne!(make_cloud_trace_header(), make_cloud_trace_header());
    }
}
