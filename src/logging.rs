//! Tracing subscriber setup for the command line binary
//!
//! Logs go to stderr; stdout belongs to the progress line.

use std::io::{self, IsTerminal};

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Default filter directive for a verbosity level
pub fn filter_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "retina_train=info,warn",
        1 => "retina_train=debug,info",
        2 => "retina_train=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the verbosity flags unless `quiet` is set.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directive = filter_directive(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let result = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else if io::stderr().is_terminal() {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, false, "retina_train=info,warn")]
    #[test_case(1, false, "retina_train=debug,info")]
    #[test_case(2, false, "retina_train=trace,debug")]
    #[test_case(7, false, "trace")]
    #[test_case(3, true, "error"; "quiet overrides verbosity")]
    fn test_filter_directive(verbosity: u8, quiet: bool, expected: &str) {
        assert_eq!(filter_directive(verbosity, quiet), expected);
    }
}
