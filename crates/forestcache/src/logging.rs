use std::env;

use forestcache_service::config::{Config, LogFormat};
use forestcache_service::logging::{default_filter, init_json_logging};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global tracing subscriber.
///
/// An explicit `RUST_LOG` wins over the configured level. With `format: auto`, a terminal gets
/// pretty output and anything else gets compact lines without colors. JSON output is set up by
/// the service crate and does not forward to sentry.
///
/// # Safety
/// May set `RUST_BACKTRACE` through [`std::env::set_var`], so it must run before any other thread
/// is started.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: The caller guarantees that no other thread exists yet.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_filter(config.logging.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let console = match (config.logging.format, console::user_attended()) {
        (LogFormat::Json, _) => return init_json_logging(&directives, std::io::stdout),
        (LogFormat::Pretty, _) | (LogFormat::Auto, true) => layer.pretty().boxed(),
        (LogFormat::Simplified, _) | (LogFormat::Auto, false) => {
            layer.compact().with_ansi(false).boxed()
        }
    };

    let sentry = sentry::integrations::tracing::layer()
        .event_filter(|metadata| sentry_event_filter(metadata.level()));

    tracing_subscriber::registry()
        .with(console.with_filter(EnvFilter::new(&directives)))
        .with(sentry)
        .init();
}

/// Errors are reported as sentry events. Errors, warnings and infos are forwarded as sentry logs.
fn sentry_event_filter(level: &tracing::Level) -> EventFilter {
    match *level {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        _ => EventFilter::Ignore,
    }
}

/// Reports a fatal error, through tracing if a subscriber would record it and on stderr otherwise.
pub fn ensure_log_error(error: &anyhow::Error) {
    let recorded = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();

    if recorded {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
