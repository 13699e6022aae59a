use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "CHORUS_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "CHORUS_TRACE_DEPS";

/// The media stack is extremely chatty at trace level.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "interceptor",
    "stun",
    "turn",
    "tokio_tungstenite",
    "tungstenite",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = filter_directives(
        config.level.to_filter(),
        std::env::var(FILTER_ENV).ok(),
        env_truthy(TRACE_DEPS_ENV),
    );

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&directives.filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);

    if directives.throttled {
        tracing::info!(
            "media stack trace output limited to info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to see it"
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Directives {
    filter: String,
    throttled: bool,
}

fn filter_directives(level: LevelFilter, explicit: Option<String>, trace_deps: bool) -> Directives {
    if let Some(filter) = explicit.filter(|filter| !filter.trim().is_empty()) {
        return Directives {
            filter,
            throttled: false,
        };
    }

    let mut filter = match level {
        LevelFilter::TRACE => "info,chorus=trace,chorus_core=trace".to_owned(),
        LevelFilter::DEBUG => "info,chorus=debug,chorus_core=debug".to_owned(),
        other => other.to_string().to_lowercase(),
    };
    let throttled = level == LevelFilter::TRACE && !trace_deps;
    if throttled {
        for target in NOISY_DEPENDENCIES {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
    }
    Directives { filter, throttled }
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_map_to_a_single_directive() {
        let directives = filter_directives(LevelFilter::WARN, None, false);
        assert_eq!(directives.filter, "warn");
        assert!(!directives.throttled);
    }

    #[test]
    fn debug_raises_only_our_crates() {
        let directives = filter_directives(LevelFilter::DEBUG, None, false);
        assert_eq!(directives.filter, "info,chorus=debug,chorus_core=debug");
    }

    #[test]
    fn trace_throttles_the_media_stack_unless_asked() {
        let throttled = filter_directives(LevelFilter::TRACE, None, false);
        assert!(throttled.throttled);
        assert!(throttled.filter.contains("webrtc_ice=info"));
        assert!(throttled.filter.starts_with("info,chorus=trace"));

        let full = filter_directives(LevelFilter::TRACE, None, true);
        assert!(!full.throttled);
        assert!(!full.filter.contains("webrtc=info"));
    }

    #[test]
    fn explicit_filter_wins() {
        let directives =
            filter_directives(LevelFilter::ERROR, Some("chorus_core::negotiator=trace".into()), false);
        assert_eq!(directives.filter, "chorus_core::negotiator=trace");

        let blank = filter_directives(LevelFilter::ERROR, Some("  ".into()), false);
        assert_eq!(blank.filter, "error");
    }
}
