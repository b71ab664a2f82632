#[macro_use]
extern crate lazy_static;

extern crate clap;

mod app;
mod args;
mod http;
mod logging;
mod metrics;
mod relay;

use clap::ArgMatches;
use cloudlog::middleware::RequestTracer;
use metrics::Metrics;
use relay::Relay;
use slog::*;
use std::{process, result::Result};

#[derive(PartialEq)]
struct ExitSignal(pub &'static str);

async fn listen_for_signals() -> Result<ExitSignal, String> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_sig = signal(SignalKind::terminate())
            .map_err(|e| format!("could not listen for TERM signals: {}", e))?;
        let mut int_sig = signal(SignalKind::interrupt())
            .map_err(|e| format!("Could not listen for INT signal: {}", e))?;
        let mut hup_sig = signal(SignalKind::hangup())
            .map_err(|e| format!("Could not listen for HUP signal: {}", e))?;

        let sig_name = tokio::select! {
            Some(_signal) = term_sig.recv() => {
                "SIG_TERM"
            },
            Some(_signal) = int_sig.recv() => {
                "SIG_INT"
            },
            Some(_signal) = hup_sig.recv() => {
                "SIG_HUP"
            },
        };
        Ok(ExitSignal(sig_name))
    }

    #[cfg(windows)]
    {
        use tokio::signal;
        signal::ctrl_c()
            .await
            .map_err(|e| format!("could not listen for ctrl-c: {}", e))?;
        Ok(ExitSignal("CTRL-C"))
    }
}

fn make_tracer(arg_matches: &ArgMatches, log: &Logger) -> RequestTracer {
    let project_id = arg_matches.value_of(args::PROJECT_ID).unwrap_or_default();
    let tracer = RequestTracer::new(log.new(o!("module" => "requests")), project_id);
    match arg_matches.value_of(args::INJECT_TRACE) {
        Some("false") => tracer.without_injection(),
        _ => tracer,
    }
}

async fn main_task(
    arg_matches: &ArgMatches,
    log: &Logger,
    metrics: &Metrics,
) -> Result<ExitSignal, String> {
    let (shutdown_sender, http_receiver) = tokio::sync::broadcast::channel(1);
    let (http_done_sender, mut shutdown_done_received) = tokio::sync::mpsc::channel(1);

    // Rebuilt on every (re)start, so a HUP also reopens the relay's writer.
    let relay = Relay::from_args(arg_matches)?;
    let handler = http::HttpHandler::new(
        log.new(o!("module" => "http")),
        make_tracer(arg_matches, log),
        relay,
        metrics.clone(),
    );

    let addr = String::from(
        arg_matches
            .value_of(args::BIND_ADDRESS_HTTP)
            .ok_or("missing --bind-address-http")?,
    );
    let http_log = log.new(o!("module" => "http"));
    tokio::spawn(async move {
        if let Err(e) = http::start(&http_log, &addr, handler, http_receiver, http_done_sender).await
        {
            error!(http_log, "HTTP Server error: {}", e)
        }
    });

    let signal = listen_for_signals().await?;
    info!(log, "Received signal {}, shutting down...", signal.0);

    drop(shutdown_sender);

    // When every sender has gone out of scope, the recv call
    // will return with an error. We ignore the error.
    let _ = shutdown_done_received.recv().await;

    Ok(signal)
}

async fn run(arg_matches: ArgMatches) -> Result<(), String> {
    let (root_logger, google_shipper) = logging::create_logger(&arg_matches)?;
    let log = root_logger.new(o!("module" => "main"));
    let metrics = Metrics::new()?;

    info!(log, "Starting {} server.", app::NAME;
    "version" => app::VERSION,
    "cloudlog-version" => app::cloudlog_version(),
    "http-address" => arg_matches.value_of(args::BIND_ADDRESS_HTTP),
    "project-id" => arg_matches.value_of(args::PROJECT_ID),
    "structured-stdout" => arg_matches.is_present(args::STRUCTURED_STDOUT),
    );

    // If logging needs to be sent to Google, we need to start tasks
    // to bridge between the sync and async channels, as well as start
    // the log shipper.
    if let Some(mut shipper) = google_shipper {
        // This is an sync to async bridge: The drain creates the
        // LogEntry's, and sends them over the sync channel. The bridge
        // receives it and forwards it over the async bridge to the shipper.
        if let Some(bridge) = shipper.yield_bridge() {
            tokio::task::spawn_blocking(move || {
                bridge.run_sync_to_async_bridge();
            });
        }

        // The shipper does the calls to Cloud Logging API
        tokio::task::spawn(async move {
            shipper.run_log_shipper().await;
        });

        info!(log, "Started Google Logger");
    }

    // We wait for a signal (HUP, INT, TERM). If the signal is a HUP,
    // we restart, otherwise we exit the loop and the program ends.
    while main_task(&arg_matches, &log, &metrics).await? == ExitSignal("SIG_HUP") {
        info!(log, "Received SIG_HUP, restarting");
    }
    info!(log, "Exiting...");
    Ok(())
}

#[tokio::main]
async fn main() {
    let arg_matches = args::clap_app().get_matches();
    if let Err(e) = run(arg_matches).await {
        eprintln!("\nError: {}", e);
        process::exit(1);
    };
}
