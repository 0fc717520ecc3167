//! Log sinks: stdout plus append-only access/error/debug files
//!
//! The access sink receives INFO and above, the error sink WARN and above.
//! The debug sink is only attached when verbose logging is enabled.

use crate::config::LoggingConfig;
use crate::error::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Holds the non-blocking writer guards; dropping them flushes and closes
/// the log files, so the binary keeps this alive for its whole run.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber from the logging configuration.
pub fn init(config: &LoggingConfig) -> Result<LogGuards> {
    let dir = Path::new(&config.dir);
    std::fs::create_dir_all(dir)?;

    let mut guards = Vec::new();

    let (access_writer, access_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "access.log"));
    guards.push(access_guard);

    let (error_writer, error_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "error.log"));
    guards.push(error_guard);

    let access_layer = tracing_subscriber::fmt::layer()
        .with_writer(access_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::INFO);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    let debug_layer = if config.verbose {
        let (debug_writer, debug_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "debug.log"));
        guards.push(debug_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(debug_writer)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
    } else {
        None
    };

    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(stdout_filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(access_layer)
        .with(error_layer)
        .with(debug_layer)
        .init();

    Ok(LogGuards { _guards: guards })
}

/// Truncate every string in a JSON body for disk logging.
pub fn truncate_json_strings(data: &str) -> String {
    const MAX_STR_LEN: usize = 32;

    fn truncate(v: &mut serde_json::Value) {
        match v {
            serde_json::Value::String(s) => {
                if s.chars().count() > MAX_STR_LEN {
                    let cut: String = s.chars().take(MAX_STR_LEN).collect();
                    *s = format!("{}...", cut);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, vv) in map.iter_mut() {
                    truncate(vv);
                }
            }
            serde_json::Value::Array(items) => {
                for item in items.iter_mut() {
                    truncate(item);
                }
            }
            _ => {}
        }
    }

    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(mut obj) => {
            truncate(&mut obj);
            serde_json::to_string(&obj).unwrap_or_else(|_| data.to_string())
        }
        Err(_) => data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_long_strings() {
        let body = format!(r#"{{"content":"{}","n":3}}"#, "x".repeat(100));
        let out = truncate_json_strings(&body);
        assert!(out.contains(&format!("{}...", "x".repeat(32))));
        assert!(out.contains("\"n\":3"));
    }

    #[test]
    fn test_short_strings_untouched() {
        let body = r#"{"content":"short"}"#;
        assert_eq!(truncate_json_strings(body), body);
    }

    #[test]
    fn test_non_json_passthrough() {
        assert_eq!(truncate_json_strings("not json"), "not json");
    }
}
