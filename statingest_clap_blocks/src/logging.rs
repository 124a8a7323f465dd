//! Common CLI flags for logging.

use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::ParseError,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Filter used when neither `--log-filter` nor `-v` is given.
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),

    #[error("cannot install the global log subscriber: {0}")]
    Init(#[from] TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogDestination {
    #[default]
    Stdout,
    Stderr,
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// human-readable, single line
    #[default]
    Full,

    /// human-readable, multi line
    Pretty,

    /// machine-parseable, one JSON object per line
    Json,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,hyper::proto::h1=info` specifies debug logging for all modules
    /// except for the `hyper::proto::h1` module which will only display info
    /// level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper::proto::h1=info,h2=info'
    ///
    /// -vvv 'trace,hyper::proto::h1=info,h2=info'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        verbatim_doc_comment
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value_t = LogDestination::default(),
        value_enum,
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The filter directive in effect, `-v` taking precedence over `--log-filter`.
    pub fn filter_directive(&self) -> &str {
        match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
            1 => "info",
            2 => "debug,hyper::proto::h1=info,h2=info",
            _ => "trace,hyper::proto::h1=info,h2=info",
        }
    }

    pub fn env_filter(&self) -> Result<EnvFilter> {
        Ok(EnvFilter::try_new(self.filter_directive())?)
    }

    /// Install a global `tracing` subscriber following this config.
    ///
    /// Fails if a global subscriber is already set.
    pub fn install_global_subscriber(&self) -> Result<()> {
        let filter = self.env_filter()?;

        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };

        let layer = match self.log_format {
            LogFormat::Full => fmt::layer().with_writer(writer).boxed(),
            LogFormat::Pretty => fmt::layer().pretty().with_writer(writer).boxed(),
            LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> LoggingConfig {
        LoggingConfig::parse_from(std::iter::once("cfg").chain(args.iter().copied()))
    }

    #[test]
    fn verbose_count_overrides_filter() {
        let cases = [
            (vec![], DEFAULT_LOG_FILTER),
            (vec!["--log-filter", "warn"], "warn"),
            (vec!["--log-filter", "warn", "-v"], "info"),
            (vec!["-vv"], "debug,hyper::proto::h1=info,h2=info"),
            (vec!["-v", "-v", "-v"], "trace,hyper::proto::h1=info,h2=info"),
            (vec!["-vvvv"], "trace,hyper::proto::h1=info,h2=info"),
        ];
        for (args, expected) in cases {
            assert_eq!(parse(&args).filter_directive(), expected, "{args:?}");
        }
    }

    #[test]
    fn format_and_destination() {
        let cfg = parse(&[]);
        assert_eq!(cfg.log_format, LogFormat::Full);
        assert_eq!(cfg.log_destination, LogDestination::Stdout);

        let cfg = parse(&["--log-format", "json", "--log-destination", "stderr"]);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_destination, LogDestination::Stderr);
    }

    #[test]
    fn invalid_filter_is_an_error() {
        let cfg = parse(&["--log-filter", "statingest=notalevel"]);
        assert!(matches!(cfg.env_filter(), Err(Error::InvalidFilter(_))));
    }
}
