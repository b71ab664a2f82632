//! Contains code pertaining to the HTTP service logrelay exposes, including prometheus metrics.
use crate::metrics::Metrics;
use crate::relay::{EntriesRequest, Relay};
use crate::app;

use cloudlog::context::{TraceContext, X_CLOUD_TRACE_HEADER};
use cloudlog::middleware::RequestTracer;
use http::HeaderValue;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use slog::*;
use std::convert::Infallible;
use std::sync::Arc;
use std::{net::SocketAddr, result::Result};
use tokio::net::TcpListener;

const PATH_HOME: &str = "/";
const PATH_METRICS: &str = "/metrics";
const PATH_HEALTH: &str = "/health";
const PATH_READINESS: &str = "/ready";
const PATH_ENTRIES: &str = "/entries";

const MAX_BODY_SIZE: usize = 1024 * 1024;

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

// starts an HTTP server that relays log entries and exports Prometheus metrics.
pub async fn start(
    log: &Logger,
    bind_addr: &str,
    handler: HttpHandler,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    done: tokio::sync::mpsc::Sender<()>,
) -> Result<(), String> {
    let http_addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| format!("unable to parse HTTP address {}: {}", bind_addr, e))?;

    let listener = TcpListener::bind(http_addr)
        .await
        .map_err(|e| format!("unable to bind HTTP address {}: {}", bind_addr, e))?;
    let http_server =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    info!(log, "Starting HTTP service."; "address" => &http_addr);
    info!(log, "Exposing {} service home.", app::NAME; "path" => PATH_HOME);
    info!(log, "Exposing Prometheus {} exporter endpoint.", app::NAME; "path" => PATH_METRICS);
    info!(log, "Exposing readiness endpoint."; "path" => PATH_READINESS);
    info!(log, "Exposing liveness endpoint."; "path" => PATH_HEALTH);
    info!(log, "Accepting log entries."; "path" => PATH_ENTRIES);

    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (stream, peer_addr) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(log, "Accept error: {}", e);
                        continue;
                    }
                };
                debug!(log, "Incoming connection accepted: {}", peer_addr);

                let stream = hyper_util::rt::TokioIo::new(stream);

                let handler = handler.clone();
                let conn = http_server.serve_connection_with_upgrades(stream, service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move { handler.router(req).await }
                }));

                let conn = graceful.watch(conn.into_owned());

                let log_clone = log.clone();
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        error!(log_clone, "connection error: {}", err);
                    }
                    debug!(log_clone, "connection dropped: {}", peer_addr);
                });
            },
            _ = shutdown.recv() => {
                drop(listener);
                info!(log, "Shutting down HTTP server");
                break;
            }
        }
    }

    graceful.shutdown().await;
    info!(log, "HTTP shutdown OK");
    drop(done);
    Ok(())
}

#[derive(Clone)]
pub struct HttpHandler {
    log: Logger,
    tracer: RequestTracer,
    relay: Arc<Relay>,
    metrics: Metrics,
}

impl HttpHandler {
    pub fn new(log: Logger, tracer: RequestTracer, relay: Relay, metrics: Metrics) -> Self {
        HttpHandler {
            log,
            tracer,
            relay: Arc::new(relay),
            metrics,
        }
    }

    // Every request goes through the tracer. The response carries the trace context it got.
    async fn router<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>, http::Error>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();

        // Injection is the only way the tracer adds this header.
        let had_context = parts.headers.contains_key(X_CLOUD_TRACE_HEADER);
        let scope = self.tracer.begin(&mut parts);
        if !had_context && parts.headers.contains_key(X_CLOUD_TRACE_HEADER) {
            self.metrics.inc_injected_context();
        }

        let response = match (&parts.method, parts.uri.path()) {
            (&Method::GET, PATH_HOME) => Ok(Response::new(UnsyncBoxBody::new(Full::new(
                self.service_home(),
            )))),
            (&Method::GET, PATH_METRICS) => Ok(Response::new(UnsyncBoxBody::new(Full::new(
                self.metrics.gather().into(),
            )))),
            (&Method::GET, PATH_HEALTH) => Response::builder()
                .status(StatusCode::OK)
                .body(UnsyncBoxBody::new(Full::<Bytes>::from("OK"))),
            (&Method::GET, PATH_READINESS) => Response::builder()
                .status(StatusCode::OK)
                .body(UnsyncBoxBody::new(Empty::<Bytes>::new())),
            (&Method::POST, PATH_ENTRIES) => self.relay_entries(&parts, &scope.log, body).await,
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(UnsyncBoxBody::new(Empty::<Bytes>::new())),
        }?;

        let (mut res_parts, res_body) = response.into_parts();
        if let Some(value) = trace_header_value(&parts.headers, &scope.context) {
            res_parts.headers.insert(X_CLOUD_TRACE_HEADER, value);
        }
        scope.finish(&parts, &res_parts);
        Ok(Response::from_parts(res_parts, res_body))
    }

    fn service_home(&self) -> Bytes {
        Bytes::from(format!("{} {}\n", app::NAME, app::VERSION))
    }

    async fn relay_entries<B>(
        &self,
        parts: &http::request::Parts,
        log: &Logger,
        body: B,
    ) -> Result<Response<ResponseBody>, http::Error>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, MAX_BODY_SIZE).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return self.reject(log, "unreadable_body", e.to_string()),
        };

        let requests = match serde_json::from_slice::<EntriesRequest>(&bytes) {
            Ok(requests) => requests.into_vec(),
            Err(e) => return self.reject(log, "invalid_json", e.to_string()),
        };

        let mut entries = Vec::with_capacity(requests.len());
        for request in requests {
            match self.relay.make_entry(request, &parts.headers) {
                Ok(entry) => entries.push(entry),
                Err(e) => return self.reject(log, e.reason(), e.to_string()),
            }
        }

        if let Err(e) = self.relay.write(&entries, log) {
            error!(log, "Could not relay log entries: {}", e);
            self.metrics.inc_rejected(e.reason());
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": e.to_string()}),
            );
        }

        for entry in &entries {
            let severity = entry.metadata.severity.unwrap_or_default();
            self.metrics
                .inc_relayed(severity.as_str(), self.relay.writer());
        }
        json_response(StatusCode::ACCEPTED, json!({"accepted": entries.len()}))
    }

    fn reject(
        &self,
        log: &Logger,
        reason: &'static str,
        message: String,
    ) -> Result<Response<ResponseBody>, http::Error> {
        warn!(log, "Rejected log entries: {}", message; "reason" => reason);
        self.metrics.inc_rejected(reason);
        json_response(StatusCode::BAD_REQUEST, json!({"error": message}))
    }
}

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> Result<Response<ResponseBody>, http::Error> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(UnsyncBoxBody::new(Full::<Bytes>::from(body.to_string())))
}

// Echoes the X-Cloud-Trace-Context of the request, or renders one for a traceparent context.
fn trace_header_value(headers: &http::HeaderMap, context: &TraceContext) -> Option<HeaderValue> {
    if let Some(value) = headers.get(X_CLOUD_TRACE_HEADER) {
        return Some(value.clone());
    }
    let trace_id = context.trace.rsplit('/').next().filter(|id| !id.is_empty())?;
    let mut value = trace_id.to_string();
    if let Some(span_id) = &context.span_id {
        value.push('/');
        value.push_str(span_id);
    }
    value.push_str(if context.trace_sampled == Some(true) {
        ";o=1"
    } else {
        ";o=0"
    });
    HeaderValue::from_str(&value).ok()
}
