use crate::args;

use args::{
    DEFAULT_LABELS, LOG_GOOGLE, LOG_LEVEL, LOG_LEVEL_LABEL, LOG_NAME, PROJECT_ID, REMOVE_CIRCULAR,
    RESOURCE_LABELS, RESOURCE_TYPE, VERBOSITY,
};
use clap::ArgMatches;
use cloudlog::log_common::format_log_name;
use cloudlog::logger::Builder;
use cloudlog::shipper::Shipper;
use slog::{error, o, Drain, Duplicate, Level, Logger, OwnedKVList, Record};
use slog_async::Async;
use slog_term::{CompactFormat, TermDecorator};
use std::{fmt::Display, result::Result};

#[derive(Clone)]
struct FallbackToStderr<D: Drain> {
    drain: D,
}

impl<D: Drain> Drain for FallbackToStderr<D>
where
    D::Err: Display,
{
    type Ok = ();
    type Err = ();
    fn log(&self, record: &Record, logger_values: &OwnedKVList) -> Result<(), ()> {
        if let Err(err) = self.drain.log(record, logger_values) {
            eprint!("A drain could not log to its destination: {}", err);
        }
        Ok(())
    }

    #[inline]
    fn is_enabled(&self, level: Level) -> bool {
        self.drain.is_enabled(level)
    }
}

/// Creates the root logger: the terminal, and Cloud Logging when `--log-google` is given. The
/// returned shipper must be started for the latter to actually ship anything.
pub fn create_logger(arg_matches: &ArgMatches) -> Result<(Logger, Option<Shipper>), String> {
    let min_log_level = match arg_matches.occurrences_of(VERBOSITY) {
        0 => Level::Warning,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };

    let min_log_level = match arg_matches.value_of(LOG_LEVEL) {
        Some(level) => match level
            .parse::<args::LogLevelType>()
            .map_err(|e| format!("unknown log level '{}': {}", level, e))?
        {
            args::LogLevelType::error => Level::Error,
            args::LogLevelType::warn => Level::Warning,
            args::LogLevelType::info => Level::Info,
            args::LogLevelType::debug => Level::Debug,
            args::LogLevelType::trace => Level::Trace,
        },
        None => min_log_level,
    };

    let decorator = TermDecorator::new().force_color().build();
    let term_drain = CompactFormat::new(decorator)
        .build()
        .map(|drain| FallbackToStderr { drain })
        .fuse();

    let mut err: Option<String> = None;
    let mut shipper: Option<Shipper> = None;
    let drain = match google_logger(arg_matches) {
        Ok(Some((google_drain, google_shipper))) => {
            shipper = Some(google_shipper);
            let both = Duplicate::new(google_drain, term_drain).fuse();
            Async::new(both.filter_level(min_log_level).fuse())
                .build()
                .fuse()
        }
        Ok(None) => Async::new(term_drain.filter_level(min_log_level).fuse())
            .build()
            .fuse(),
        Err(e) => {
            err = e.into();
            Async::new(term_drain.filter_level(min_log_level).fuse())
                .build()
                .fuse()
        }
    };
    let root = Logger::root(drain, o!());
    let log = root.new(o!());
    if let Some(err_str) = err {
        error!(log, "Continuing only with terminal logger: {}", err_str)
    }
    Ok((log, shipper))
}

fn google_logger(m: &ArgMatches) -> Result<Option<(cloudlog::logger::Logger, Shipper)>, String> {
    if !m.is_present(LOG_GOOGLE) {
        return Ok(None);
    }

    let project_id = m
        .value_of(PROJECT_ID)
        .ok_or("for the Google logger please specify --project-id")?;
    let log_name = format_log_name(project_id, m.value_of(LOG_NAME).unwrap_or(crate::app::NAME));
    let resource_type = m.value_of(RESOURCE_TYPE).unwrap_or("global");

    let mut builder = Builder::new(&log_name, resource_type)
        .with_project_id(project_id)
        .with_remove_circular(m.is_present(REMOVE_CIRCULAR));
    if let Some(labels) = m.value_of(RESOURCE_LABELS) {
        builder = builder
            .with_resource_labels(parse_json(RESOURCE_LABELS, labels)?)
            .map_err(|e| format!("could not initialize Google logger: {}", e))?;
    }
    if let Some(labels) = m.value_of(DEFAULT_LABELS) {
        builder = builder
            .with_default_labels(parse_json(DEFAULT_LABELS, labels)?)
            .map_err(|e| format!("could not initialize Google logger: {}", e))?;
    }
    if let Some(label) = m.value_of(LOG_LEVEL_LABEL) {
        builder = builder.with_log_level_label(label);
    }

    Ok(Some(builder.build_with_async_shipper()))
}

fn parse_json(option: &str, value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("--{} is not valid JSON: {}", option, e))
}
