use chrono::Local;
use log::{Level, Metadata, Record};
use serde::Serialize;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::broadcast;

static LOGGER: OnceLock<SessionLogger> = OnceLock::new();

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
#[error("a logger is already installed")]
pub struct LoggerAlreadySet;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and forwards them to any UI subscriber.
pub struct SessionLogger {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
}

impl SessionLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { sender, level }
    }

    /// Installs the logger process-wide. Fails if any logger is already set.
    pub fn init(level: Level) -> Result<(), LoggerAlreadySet> {
        LOGGER
            .set(SessionLogger::new(level))
            .map_err(|_| LoggerAlreadySet)?;
        let logger = LOGGER.get().ok_or(LoggerAlreadySet)?;
        log::set_logger(logger).map_err(|_| LoggerAlreadySet)?;
        log::set_max_level(level.to_level_filter());
        Ok(())
    }

    /// Installs `env_logger` when `RUST_LOG` is set, the session logger otherwise.
    pub fn init_from_env_or(level: Level) {
        let result = if std::env::var_os("RUST_LOG").is_some() {
            env_logger::try_init().map_err(|_| LoggerAlreadySet)
        } else {
            Self::init(level)
        };
        if let Err(e) = result {
            eprintln!("[WARN] {}, keeping it", e);
        }
    }

    /// Receives every record logged after this call, if the session logger is installed.
    pub fn subscribe() -> Option<broadcast::Receiver<LogMessage>> {
        LOGGER.get().map(|logger| logger.sender.subscribe())
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // no subscribers is not an error
        let _ = self.sender.send(log_message);
    }
}

impl log::Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn records_above_the_level_are_not_forwarded() {
        let logger = SessionLogger::new(Level::Info);
        let mut rx = logger.sender.subscribe();

        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("per-packet noise"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("Connection to A timed out"))
                .build(),
        );

        let message = rx.try_recv().unwrap();
        assert_eq!(message.level, "WARN");
        assert_eq!(message.message, "Connection to A timed out");
        assert!(chrono::DateTime::parse_from_rfc3339(&message.timestamp).is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_install_is_rejected_and_keeps_the_first_level() {
        assert!(SessionLogger::init(Level::Warn).is_ok());
        assert!(SessionLogger::init(Level::Trace).is_err());

        assert_eq!(log::max_level(), log::LevelFilter::Warn);
        assert_eq!(LOGGER.get().map(|logger| logger.level), Some(Level::Warn));
        assert!(SessionLogger::subscribe().is_some());
    }
}
