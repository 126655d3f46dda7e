// crates/shutter-capture/src/logging.rs
//
// File logger behind the `log` facade: every line goes to stderr and is
// appended to `shutter_log.txt` in the resource root, timestamped, so a
// failed recording leaves a trail even when the host owns the console.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{LevelFilter, Metadata, Record};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Log file name inside the resource root.
pub const LOG_FILE_NAME: &str = "shutter_log.txt";

struct FileLogger {
    file: Mutex<File>,
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("?"));
        let line = format!("{stamp} [{}] {}", record.level(), record.args());

        eprintln!("{line}");
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Install the file logger. Safe to call more than once; later calls are
/// no-ops (the facade accepts exactly one logger per process).
pub fn init(resource_root: &Path) -> Result<()> {
    let path = resource_root.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    let logger = Box::new(FileLogger { file: Mutex::new(file) });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
    Ok(())
}
