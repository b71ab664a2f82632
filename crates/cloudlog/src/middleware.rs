use crate::context::{get_or_inject_context, TraceContext};
use crate::http_request::{make_http_request_data, HttpRequest};

use slog::{info, o, Logger};
use std::time::Instant;

/// Establishes the trace context of incoming requests and emits a request log when they finish.
///
/// ```
/// use cloudlog::middleware::RequestTracer;
/// use slog::{info, o, Discard, Logger};
///
/// let tracer = RequestTracer::new(Logger::root(Discard, o!()), "my-project");
/// let (mut req, _) = http::Request::new(()).into_parts();
/// let scope = tracer.begin(&mut req);
/// assert!(req.headers.contains_key("x-cloud-trace-context"));
/// info!(scope.log, "handling request");
/// ```
#[derive(Clone)]
pub struct RequestTracer {
    log: Logger,
    project_id: String,
    inject: bool,
    emit_request_log: bool,
}

/// The trace context of one request, with a logger that carries it.
pub struct RequestScope {
    pub context: TraceContext,
    /// Child logger with `trace`, `span_id` and `trace_sampled` set.
    pub log: Logger,
    parent: Logger,
    started: Instant,
    emit_request_log: bool,
}

impl RequestTracer {
    pub fn new(log: Logger, project_id: &str) -> Self {
        RequestTracer {
            log,
            project_id: project_id.to_string(),
            inject: true,
            emit_request_log: true,
        }
    }

    /// Only detects trace context, leaving requests without one untouched.
    #[must_use]
    pub fn without_injection(self) -> Self {
        RequestTracer {
            inject: false,
            ..self
        }
    }

    /// Only establishes context and child loggers, without logging finished requests.
    #[must_use]
    pub fn without_request_log(self) -> Self {
        RequestTracer {
            emit_request_log: false,
            ..self
        }
    }

    /// Detects the trace context of the request. When there is none, a new
    /// `X-Cloud-Trace-Context` header is injected so the context is always available downstream.
    pub fn begin(&self, req: &mut http::request::Parts) -> RequestScope {
        let started = Instant::now();
        let context = get_or_inject_context(Some(&mut req.headers), &self.project_id, self.inject);

        let trace = Some(context.trace.clone()).filter(|t| !t.is_empty());
        let span_id = context.span_id.clone().filter(|s| !s.is_empty());
        let trace_sampled = context.trace_sampled.filter(|sampled| *sampled);
        let log = self.log.new(o!(
            "trace" => trace,
            "span_id" => span_id,
            "trace_sampled" => trace_sampled,
        ));

        RequestScope {
            context,
            log,
            parent: self.log.clone(),
            started,
            emit_request_log: self.emit_request_log,
        }
    }
}

impl RequestScope {
    /// Collects the request log data and emits it on the parent logger, with the trace context of
    /// the request.
    pub fn finish(
        self,
        req: &http::request::Parts,
        res: &http::response::Parts,
    ) -> HttpRequest {
        let data = make_http_request_data(req, Some(res), Some(self.started.elapsed()));
        if self.emit_request_log {
            let trace = Some(self.context.trace).filter(|t| !t.is_empty());
            let span_id = self.context.span_id.filter(|s| !s.is_empty());
            let trace_sampled = self.context.trace_sampled.filter(|sampled| *sampled);
            info!(self.parent, "{} {} {}", req.method, req.uri, res.status.as_u16();
                "trace" => trace,
                "span_id" => span_id,
                "trace_sampled" => trace_sampled,
                "http_request" => data.clone(),
            );
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::X_CLOUD_TRACE_HEADER;
    use crate::logger::Builder;
    use google_logging2::api::WriteLogEntriesRequest;
    use pretty_assertions::assert_eq;
    use slog::Drain;
    use std::sync::mpsc::Receiver;
    use std::sync::Mutex;
    use std::time::Duration;

    fn tracer() -> (RequestTracer, Receiver<WriteLogEntriesRequest>) {
        let (drain, rx) = Builder::new("projects/p/logs/requests", "global").build();
        let log = Logger::root(Mutex::new(drain).fuse(), o!());
        (RequestTracer::new(log, "p"), rx)
    }

    fn request(trace_header: Option<&str>) -> http::request::Parts {
        let mut builder = http::Request::builder().method("GET").uri("/entries");
        if let Some(header) = trace_header {
            builder = builder.header(X_CLOUD_TRACE_HEADER, header);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn injects_context_when_missing() {
        let (tracer, _rx) = tracer();
        let mut req = request(None);
        let scope = tracer.begin(&mut req);

        let header = req.headers[X_CLOUD_TRACE_HEADER].to_str().unwrap();
        let trace_id = header.split('/').next().unwrap();
        assert_eq!(scope.context.trace, format!("projects/p/traces/{trace_id}"));
        assert_eq!(scope.context.trace_sampled, Some(true));
    }

    #[test]
    fn child_logger_carries_the_trace() {
        let (tracer, rx) = tracer();
        let mut req = request(Some("105445aa7843bc8bf206b12000100000/1;o=1"));
        let scope = tracer.begin(&mut req);
        info!(scope.log, "inside");

        let entry = rx.recv().unwrap().entries.unwrap().remove(0);
        assert_eq!(
            entry.trace.as_deref(),
            Some("projects/p/traces/105445aa7843bc8bf206b12000100000")
        );
        assert_eq!(entry.span_id.as_deref(), Some("1"));
        assert_eq!(entry.trace_sampled, Some(true));
    }

    #[test]
    fn finish_emits_the_request_log() {
        let (tracer, rx) = tracer();
        let mut req = request(Some("abc/2;o=0"));
        let scope = tracer.begin(&mut req);
        let (res, _) = http::Response::builder()
            .status(204)
            .body(())
            .unwrap()
            .into_parts();

        let data = scope.finish(&req, &res);
        assert_eq!(data.status, Some(204));

        let entry = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .entries
            .unwrap()
            .remove(0);
        assert_eq!(entry.trace.as_deref(), Some("projects/p/traces/abc"));
        assert_eq!(entry.trace_sampled, None);
        let http_request = entry.http_request.unwrap();
        assert_eq!(http_request.request_method.as_deref(), Some("GET"));
        assert_eq!(http_request.status, Some(204));
        assert_eq!(
            entry.json_payload.unwrap()["message"],
            serde_json::json!("GET /entries 204")
        );
    }

    #[test]
    fn injection_can_be_turned_off() {
        let (tracer, _rx) = tracer();
        let tracer = tracer.without_injection();
        let mut req = request(None);
        let scope = tracer.begin(&mut req);
        assert!(!req.headers.contains_key(X_CLOUD_TRACE_HEADER));
        assert_eq!(scope.context, TraceContext::default());
    }

    #[test]
    fn requests_without_context_log_no_trace() {
        let (tracer, rx) = tracer();
        let tracer = tracer.without_injection();
        let mut req = request(None);
        let scope = tracer.begin(&mut req);
        info!(scope.log, "inside");
        let (res, _) = http::Response::new(()).into_parts();
        scope.finish(&req, &res);

        for _ in 0..2 {
            let entry = rx
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .entries
                .unwrap()
                .remove(0);
            assert_eq!(entry.trace, None);
            assert_eq!(entry.span_id, None);
            assert!(!entry.json_payload.unwrap().contains_key("trace"));
        }
    }

    #[test]
    fn request_log_can_be_turned_off() {
        let (tracer, rx) = tracer();
        let tracer = tracer.without_request_log();
        let mut req = request(None);
        let (res, _) = http::Response::new(()).into_parts();
        tracer.begin(&mut req).finish(&req, &res);
        assert!(rx.try_recv().is_err());
    }
}
