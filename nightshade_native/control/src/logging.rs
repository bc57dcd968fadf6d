//! Logging setup for the control service
//!
//! Console output always; with a log directory, a daily rolling file as well.

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log file prefix; the appender adds `.YYYY-MM-DD`
pub const LOG_FILE_PREFIX: &str = "nightshade-control.log";

/// Days of log files kept on startup
pub const LOG_RETENTION_DAYS: i64 = 7;

// Flushes the file writer when the process exits
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Returns false if a
/// subscriber was already installed.
pub fn init_logging(log_dir: Option<&Path>) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!("Logging initialized (console only)");
        }
        return installed;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        return init_logging(None);
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(false).with_ansi(true);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return false;
    }

    LOG_GUARD.set(guard).ok();
    tracing::info!("Logging initialized, log directory: {}", log_dir.display());

    cleanup_old_logs(log_dir, LOG_RETENTION_DAYS);
    true
}

/// Delete rolled log files older than `keep_days`. Returns how many were removed.
fn cleanup_old_logs(log_dir: &Path, keep_days: i64) -> usize {
    let cutoff = chrono::Local::now().date_naive() - chrono::Duration::days(keep_days);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(file_date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_log_date)
        else {
            continue;
        };

        if file_date < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!("Deleted old log file: {:?}", path);
                    removed += 1;
                }
                Err(e) => tracing::warn!("Failed to delete old log file {:?}: {}", path, e),
            }
        }
    }
    removed
}

// "nightshade-control.log.2024-01-15" -> 2024-01-15
fn rolled_log_date(file_name: &str) -> Option<chrono::NaiveDate> {
    let date = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nightshade-control-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_rolled_log_date() {
        assert_eq!(
            rolled_log_date("nightshade-control.log.2024-01-15"),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(rolled_log_date("nightshade-control.log"), None);
        assert_eq!(rolled_log_date("nightshade-control.log.today"), None);
        assert_eq!(rolled_log_date("other.log.2024-01-15"), None);
    }

    #[test]
    fn test_cleanup_removes_only_old_rolled_files() {
        let dir = scratch_dir("cleanup");
        let today = chrono::Local::now().date_naive();
        let old = today - chrono::Duration::days(30);

        let old_file = dir.join(format!("{}.{}", LOG_FILE_PREFIX, old.format("%Y-%m-%d")));
        let new_file = dir.join(format!("{}.{}", LOG_FILE_PREFIX, today.format("%Y-%m-%d")));
        let unrelated = dir.join("notes.txt");
        for path in [&old_file, &new_file, &unrelated] {
            std::fs::write(path, "x").unwrap();
        }

        assert_eq!(cleanup_old_logs(&dir, LOG_RETENTION_DAYS), 1);
        assert!(!old_file.exists());
        assert!(new_file.exists());
        assert!(unrelated.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cleanup_missing_directory() {
        let dir = std::env::temp_dir().join("nightshade-control-does-not-exist");
        assert_eq!(cleanup_old_logs(&dir, LOG_RETENTION_DAYS), 0);
    }
}
