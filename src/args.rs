use crate::app;
use clap::{Arg, Command};

pub const BIND_ADDRESS_HTTP: &str = "bind-address-http";
pub const DEFAULT_LABELS: &str = "default-labels";
pub const INJECT_TRACE: &str = "inject-trace";
pub const LOG_GOOGLE: &str = "log-google";
pub const LOG_LEVEL: &str = "log-level";
pub const LOG_LEVEL_LABEL: &str = "log-level-label";
pub const LOG_NAME: &str = "log-name";
pub const PROJECT_ID: &str = "project-id";
pub const REMOVE_CIRCULAR: &str = "remove-circular";
pub const RESOURCE_LABELS: &str = "resource-labels";
pub const RESOURCE_TYPE: &str = "resource-type";
pub const STRUCTURED_STDOUT: &str = "structured-stdout";
pub const VERBOSITY: &str = "verbosity";

#[derive(Debug, PartialEq, Eq, Clone, Copy, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
#[allow(non_camel_case_types)]
pub enum LogLevelType {
    error,
    warn,
    info,
    debug,
    trace,
}

pub(crate) fn clap_app() -> Command<'static> {
    Command::new(app::NAME)
        .version(app::VERSION)
        .long_version(app::long_version())
        .about("An HTTP log relay that traces requests and writes entries for Google Cloud Logging")
        .arg(
            Arg::new(VERBOSITY)
                .short('v')
                .multiple_occurrences(true)
                .help("verbosity level"),
        )
        .arg(
            Arg::new(LOG_LEVEL)
                .long("log-level")
                .value_name("LEVEL")
                .help("Sets the minimum log level, overriding the verbosity flags")
                .possible_values(["error", "warn", "info", "debug", "trace"])
                .env("LOGRELAY_LOG_LEVEL")
                .takes_value(true),
        )
        .arg(
            Arg::new(BIND_ADDRESS_HTTP)
                .long("bind-address-http")
                .value_name("HOST_PORT")
                .help("Sets the host and port to listen on for HTTP requests")
                .default_value("0.0.0.0:8080")
                .env("LOGRELAY_BIND_ADDRESS_HTTP")
                .takes_value(true),
        )
        .arg(
            Arg::new(PROJECT_ID)
                .long("project-id")
                .value_name("PROJECT")
                .help("The Google Cloud project used to qualify trace ids and log names")
                .env("LOGRELAY_PROJECT_ID")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new(LOG_NAME)
                .long("log-name")
                .value_name("LOG_ID")
                .help("The log that relayed entries are written to")
                .default_value(app::NAME)
                .env("LOGRELAY_LOG_NAME")
                .takes_value(true),
        )
        .arg(
            Arg::new(RESOURCE_TYPE)
                .long("resource-type")
                .value_name("TYPE")
                .help("The monitored resource type of the entries, e.g. k8s_container")
                .default_value("global")
                .env("LOGRELAY_RESOURCE_TYPE")
                .takes_value(true),
        )
        .arg(
            Arg::new(RESOURCE_LABELS)
                .long("resource-labels")
                .value_name("JSON")
                .help("The monitored resource labels, as a JSON object of strings")
                .env("LOGRELAY_RESOURCE_LABELS")
                .takes_value(true),
        )
        .arg(
            Arg::new(DEFAULT_LABELS)
                .long("default-labels")
                .value_name("JSON")
                .help("Labels added to every entry, as a JSON object of strings")
                .env("LOGRELAY_DEFAULT_LABELS")
                .takes_value(true),
        )
        .arg(
            Arg::new(LOG_LEVEL_LABEL)
                .long("log-level-label")
                .value_name("LABEL")
                .help("When set, the log level of the service's own logs is added under this label")
                .env("LOGRELAY_LOG_LEVEL_LABEL")
                .takes_value(true),
        )
        .arg(
            Arg::new(LOG_GOOGLE)
                .long("log-google")
                .help("Ships the service's own logs to the Cloud Logging API")
                .env("LOGRELAY_LOG_GOOGLE"),
        )
        .arg(
            Arg::new(STRUCTURED_STDOUT)
                .long("structured-stdout")
                .help("Writes relayed entries as structured JSON lines to stdout instead of through the logger")
                .env("LOGRELAY_STRUCTURED_STDOUT"),
        )
        .arg(
            Arg::new(INJECT_TRACE)
                .long("inject-trace")
                .value_name("BOOL")
                .help("Injects an X-Cloud-Trace-Context header into requests without trace context")
                .possible_values(["true", "false"])
                .default_value("true")
                .env("LOGRELAY_INJECT_TRACE")
                .takes_value(true),
        )
        .arg(
            Arg::new(REMOVE_CIRCULAR)
                .long("remove-circular")
                .help("Replaces circular references in payloads instead of rejecting the entry")
                .env("LOGRELAY_REMOVE_CIRCULAR"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let m = clap_app()
            .try_get_matches_from(["logrelay", "--project-id", "p"])
            .unwrap();
        assert_eq!(m.value_of(BIND_ADDRESS_HTTP), Some("0.0.0.0:8080"));
        assert_eq!(m.value_of(LOG_NAME), Some(app::NAME));
        assert_eq!(m.value_of(INJECT_TRACE), Some("true"));
        assert!(!m.is_present(STRUCTURED_STDOUT));
    }

    #[test]
    fn project_is_required() {
        assert!(clap_app().try_get_matches_from(["logrelay"]).is_err());
    }

    #[test]
    fn counts_verbosity() {
        let m = clap_app()
            .try_get_matches_from(["logrelay", "--project-id", "p", "-vv"])
            .unwrap();
        assert_eq!(m.occurrences_of(VERBOSITY), 2);
    }

    #[test]
    fn parses_log_levels() {
        assert_eq!("debug".parse::<LogLevelType>(), Ok(LogLevelType::debug));
        assert!("loud".parse::<LogLevelType>().is_err());
    }
}
