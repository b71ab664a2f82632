//! Building blocks for writing to [Google Cloud Logging](https://cloud.google.com/logging) from Rust services.
//!
//! # Usage
//!
//! The crate covers the request side and the writing side of logging:
//!
//! * [`context`] detects the trace context of an HTTP request from the W3C `traceparent` or the
//!   `X-Cloud-Trace-Context` header, and can inject a new one. [`middleware`] applies that to every
//!   request and hands out a child logger carrying the trace.
//! * [`structs`] converts dynamic objects to the protobuf `Struct` wire form and back, dealing with
//!   circular references.
//! * [`entry`] turns a payload and its metadata into a [LogEntry](https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry)
//!   or into the structured JSON that logging agents read from stdout.
//!
//! Entries can be written in three ways:
//!
//! 1. [`LogSync`](log_sync::LogSync) writes structured JSON lines to stdout or any other writer.
//! 2. [`build()`](logger::Builder::build) creates a [`slog::Drain`](https://slog-rs.github.io/slog/slog/trait.Drain.html) that
//!    sends [`WriteLogEntries`](https://cloud.google.com/logging/docs/reference/v2/rpc/google.logging.v2#google.logging.v2.LoggingServiceV2.WriteLogEntries) over a channel and allows you to handle the transportation manually.
//! 3. [`build_with_async_shipper()`](logger::Builder::build_with_async_shipper) offloads transportation to the [`Shipper`](shipper::Shipper) and its sync-async Bridge in an async context. (Requires the `shipper` feature.)
//!
//! Warning: The shipper only works in the context of [workload identity](https://cloud.google.com/iam/docs/workload-identity-federation).
//!

/// Trace context detection and injection
pub mod context;

/// Log entries and their wire forms
pub mod entry;

/// Error types
pub mod error;

/// The `httpRequest` part of log entries
pub mod http_request;

/// Helpers shared by the log writers
pub mod log_common;

/// A synchronous writer of structured log lines
pub mod log_sync;

/// The [`slog::Drain`](https://slog-rs.github.io/slog/slog/trait.Drain.html) Implementation for [Google Cloud Logging](https://cloud.google.com/logging)
pub mod logger;

/// Per request trace context and request logs
pub mod middleware;

/// Log severities
pub mod severity;

/// An optional async process to ship the log for you
#[cfg(feature = "shipper")]
pub mod shipper;

/// Conversion between dynamic objects and the protobuf `Struct`
pub mod structs;
