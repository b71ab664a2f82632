use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The [`httpRequest`](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry#HttpRequest)
/// part of a log entry, in the shape logging agents expect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Latency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A protobuf `Duration` in its object form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub seconds: u64,
    pub nanos: u32,
}

impl From<Duration> for Latency {
    fn from(d: Duration) -> Self {
        Latency {
            seconds: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

impl Latency {
    /// The JSON mapping of a protobuf `Duration`, e.g. `1.500000000s`.
    pub fn to_duration_string(&self) -> String {
        format!("{}.{:09}s", self.seconds, self.nanos)
    }
}

impl HttpRequest {
    /// The REST API form, where 64 bit integers are strings and durations are `"<secs>s"`.
    pub fn to_api_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let mut put = |key: &str, v: Option<serde_json::Value>| {
            if let Some(v) = v {
                map.insert(key.to_string(), v);
            }
        };
        put("requestMethod", self.request_method.clone().map(Into::into));
        put("requestUrl", self.request_url.clone().map(Into::into));
        put("userAgent", self.user_agent.clone().map(Into::into));
        put("status", self.status.map(Into::into));
        put("responseSize", self.response_size.map(|s| s.to_string().into()));
        put("latency", self.latency.map(|l| l.to_duration_string().into()));
        put("remoteIp", self.remote_ip.clone().map(Into::into));
        put("referer", self.referer.clone().map(Into::into));
        put("protocol", self.protocol.clone().map(Into::into));
        serde_json::Value::Object(map)
    }
}

// Carried through slog records as JSON, so a drain can restore it.
impl slog::Value for HttpRequest {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        let json = serde_json::to_string(self).map_err(|_| slog::Error::Other)?;
        serializer.emit_str(key, &json)
    }
}

/// Collects the request log data from a request, and optionally its response and the time it took.
///
/// The response size is taken from the `Content-Length` header and is `0` when that is missing.
/// A zero latency is left out.
pub fn make_http_request_data(
    req: &http::request::Parts,
    res: Option<&http::response::Parts>,
    latency: Option<Duration>,
) -> HttpRequest {
    let header = |headers: &http::HeaderMap, name: http::header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    HttpRequest {
        request_method: Some(req.method.to_string()),
        request_url: Some(req.uri.to_string()),
        user_agent: header(&req.headers, http::header::USER_AGENT),
        referer: header(&req.headers, http::header::REFERER),
        protocol: Some(format!("{:?}", req.version)),
        status: res.map(|res| res.status.as_u16()),
        response_size: res.map(|res| {
            header(&res.headers, http::header::CONTENT_LENGTH)
                .and_then(|len| len.parse().ok())
                .unwrap_or(0)
        }),
        latency: latency.filter(|l| !l.is_zero()).map(Latency::from),
        ..Default::default()
    }
}
