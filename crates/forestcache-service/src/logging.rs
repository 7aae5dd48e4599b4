use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Returns the default `RUST_LOG` directives for the configured level.
///
/// Only the forestcache crates are raised beyond `INFO`, since the parsers of a backend tend to be
/// extremely chatty on `DEBUG`.
pub fn default_filter(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             forestcache=DEBUG,\
             forestcache_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             forestcache=TRACE,\
             forestcache_service=TRACE"
        }
    }
}

/// Installs a global subscriber writing one JSON object per event to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}
