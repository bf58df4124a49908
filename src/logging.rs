//! Logger setup.
//!
//! The configured [`LogLevel`] is the default filter and `RUST_LOG` overrides
//! it. When a session log path is given, records go to that file so that a
//! critical worker failure can point the operator to it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::LogLevel;

/// Default session log location inside the user's data directory.
pub fn default_session_log() -> Option<PathBuf> {
    let dir = dirs::data_local_dir().or_else(dirs::home_dir)?;
    Some(dir.join("acdc").join("logs").join(format!(
        "session_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    )))
}

/// Initialise the global logger.
///
/// Calling this more than once is harmless: later calls keep the logger
/// installed by the first one.
pub fn init(level: LogLevel, session_log: Option<&Path>) -> std::io::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.to_level_filter())
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    if let Some(path) = session_log {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialised");
    } else {
        log::info!("Logging at {} level", level.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        assert!(init(LogLevel::Warn, None).is_ok());
        assert!(init(LogLevel::Debug, None).is_ok());
    }
}
