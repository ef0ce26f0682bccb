//! Diagnostic logging setup.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogLevel;

/// Diagnostic log file, next to the security event logs.
pub const LOG_FILE: &str = "defensiq.log";

/// Filter used when `RUST_LOG` is not set: `--debug` wins over the
/// configured `logging.level`.
pub fn default_directive(debug: bool, level: LogLevel) -> String {
    let level = if debug { LogLevel::Debug } else { level };
    format!("defensiq={}", level.as_directive())
}

/// Install the global subscriber: stderr, plus `<log_dir>/defensiq.log`
/// when a directory is given.
pub fn init(debug: bool, level: LogLevel, log_dir: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug, level)));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_raise_verbosity_in_debug() {
        assert_eq!(default_directive(true, LogLevel::Error), "defensiq=debug");
        assert_eq!(default_directive(false, LogLevel::Info), "defensiq=info");
    }

    #[test]
    fn should_follow_configured_level() {
        assert_eq!(default_directive(false, LogLevel::Warning), "defensiq=warn");
        assert_eq!(default_directive(false, LogLevel::Error), "defensiq=error");
    }

    #[test]
    fn should_create_log_file() {
        let dir = tempfile::TempDir::new().unwrap();

        init(false, LogLevel::Info, Some(dir.path())).unwrap();

        assert!(dir.path().join(LOG_FILE).exists());
    }
}
