//! Logging setup: console plus daily-rotated file output.
//!
//! The whole crate logs through `log::` macros; they are bridged into
//! `tracing` so both layers share one filter. File logs carry thread and
//! location fields for postmortems, console output stays terse. Old log
//! files are swept out by retention days on startup.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging with console and file output.
///
/// `retention_days` bounds how long rotated files in `log_dir` are kept;
/// `verbose` lowers the default filter to debug.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "telerec.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer guard must outlive the process; leak it.
    let _ = Box::leak(Box::new(Arc::new(guard)));

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(LocalTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    // Route log:: macros into tracing.
    tracing_log::LogTracer::init()
        .map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Remove rotated log files older than the retention window.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_log_file = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains("telerec.log"))
                .unwrap_or(false);
        if !is_log_file {
            continue;
        }

        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            let modified: chrono::DateTime<Local> = modified.into();
            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("Failed to remove old log file {:?}: {}", path, e);
                }
            }
        }
    }

    Ok(())
}

/// Local-time timestamps in log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
