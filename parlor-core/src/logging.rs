use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::schema::LoggingConfig;

/// Prefix of the rolling log files, e.g. `parlor.log.2024-05-01`
const LOG_FILE_PREFIX: &str = "parlor.log";

/// Days a rolled log file is kept before cleanup
const LOG_RETENTION_DAYS: u64 = 7;

/// Initialize the logging system
///
/// Console output goes to stderr so it never interleaves with the streamed
/// reply the CLI prints on stdout.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let filter = build_filter(config);

    let format_str = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.format.clone());
    let is_json = format_str.eq_ignore_ascii_case("json");

    let file_appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = if is_json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .boxed()
    };

    let file_layer = if is_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    // try_init: a second init (tests, embedding) must not panic
    if let Err(e) = Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }

    if let Err(e) = cleanup_old_logs(&config.dir, LOG_RETENTION_DAYS) {
        eprintln!("Failed to clean up old logs: {}", e);
    }

    guard
}

/// Build the level filter: RUST_LOG wins over the configured level, then
/// per-module overrides from the config are layered on top.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    for (module, level) in &config.overrides {
        match format!("{}={}", module, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => eprintln!("Invalid log directive: {}={}", module, level),
        }
    }

    filter
}

/// Clean up log files older than `days` days
fn cleanup_old_logs(dir: &str, days: u64) -> std::io::Result<()> {
    let path = Path::new(dir);
    if !path.exists() {
        return Ok(());
    }

    let now = std::time::SystemTime::now();
    let threshold = std::time::Duration::from_secs(days * 24 * 3600);

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());

        if age.is_some_and(|age| age > threshold) {
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("Failed to remove old log file {:?}: {}", path, e);
            }
        }
    }
    Ok(())
}
