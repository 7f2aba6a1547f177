//! Stderr backend for the `log` facade.
//!
//! Lines look like `2022/05/14 08:30:00 - [mailbox] INFO Sending home/mailbox/ota-req: ON`.

use std::io::Write;

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

pub struct Logger {
    device: String,
    level: LevelFilter,
}

impl Logger {
    pub fn new(device: &str, level: LevelFilter) -> Self {
        Self {
            device: device.to_string(),
            level,
        }
    }

    pub fn format(&self, record: &Record) -> String {
        format!(
            "{} - [{}] {} {}",
            Local::now().format(TIME_FORMAT),
            self.device,
            record.level(),
            record.args()
        )
    }

    /// Library targets stay at `Warn` unless tracing everything.
    fn limit_for(&self, target: &str) -> LevelFilter {
        if is_own_target(target) || self.level == LevelFilter::Trace {
            self.level
        } else {
            self.level.min(LevelFilter::Warn)
        }
    }
}

fn is_own_target(target: &str) -> bool {
    target == "build" || target.starts_with("deep_ota") || target.starts_with("deep-ota")
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.limit_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line = self.format(record);
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{line}");
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the logger as the global `log` backend.
pub fn init(device: &str, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger::new(device, level)))
        .map(|()| log::set_max_level(level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn metadata(level: Level, target: &str) -> Metadata<'_> {
        Metadata::builder().level(level).target(target).build()
    }

    #[test]
    fn line_carries_device_and_level() {
        let logger = Logger::new("mailbox", LevelFilter::Info);
        let line = logger.format(
            &Record::builder()
                .args(format_args!("Sending home/mailbox/ota-req: ON"))
                .level(Level::Info)
                .target("deep_ota::ota")
                .build(),
        );

        assert!(line.ends_with(" - [mailbox] INFO Sending home/mailbox/ota-req: ON"));
        // "YYYY/MM/DD HH:MM:SS"
        assert_eq!(line.find(" - ["), Some(19));
    }

    #[test]
    fn own_targets_follow_configured_level() {
        let logger = Logger::new("mailbox", LevelFilter::Info);
        assert!(logger.enabled(&metadata(Level::Info, "deep_ota::ota::coordinator")));
        assert!(logger.enabled(&metadata(Level::Info, "build")));
        assert!(!logger.enabled(&metadata(Level::Debug, "deep_ota::transport::mqtt")));
    }

    #[test]
    fn library_targets_are_capped_at_warn() {
        let logger = Logger::new("mailbox", LevelFilter::Debug);
        assert!(!logger.enabled(&metadata(Level::Info, "rumqttc::state")));
        assert!(logger.enabled(&metadata(Level::Warn, "rumqttc::state")));

        let tracing = Logger::new("mailbox", LevelFilter::Trace);
        assert!(tracing.enabled(&metadata(Level::Debug, "rumqttc::state")));
    }
}
