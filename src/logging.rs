//! Logging for blescout
//!
//! A small `log::Log` implementation: timestamped lines to stderr (colored)
//! and optionally to a file, with debug output gated per category.

use chrono::Local;
use log::Level;
use log::{LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::{Once, RwLock};

use crate::config::LogLevel;
use crate::error::{ErrorKind, ScanError};

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Debug flag categories for selective logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub scanner: bool,      // radio adapter and advertisement intake
    pub registry: bool,     // in-memory device table
    pub store: bool,        // SQLite history and migrations
    pub location: bool,     // location fixes
    pub orchestrator: bool, // scan lifecycle and event pump
    pub all: bool,
}

impl DebugFlags {
    /// Everything on
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Parse a comma separated list such as `"scanner,store"`
    pub fn parse(list: &str) -> Self {
        let mut flags = Self::default();
        for name in list.split(',').map(str::trim) {
            match name {
                "scanner" | "bluetooth" => flags.scanner = true,
                "registry" => flags.registry = true,
                "store" => flags.store = true,
                "location" => flags.location = true,
                "orchestrator" => flags.orchestrator = true,
                "all" => flags.all = true,
                "" => {}
                other => log::warn!("Unknown debug category: {}", other),
            }
        }
        flags
    }
}

/// Global debug flags storage
static DEBUG_FLAGS: RwLock<DebugFlags> = RwLock::new(DebugFlags {
    scanner: false,
    registry: false,
    store: false,
    location: false,
    orchestrator: false,
    all: false,
});

/// Logger installed by `configure_logging`
pub struct BlescoutLogger {
    file: Option<Mutex<File>>,
    level: LevelFilter,
    console_output: bool,
}

impl log::Log for BlescoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.level {
            return false;
        }

        if metadata.level() == Level::Debug {
            return should_log_debug(metadata.target());
        }

        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let module = record.module_path().unwrap_or("<unknown>");

        if self.console_output {
            let entry = format_entry(&timestamp, colored_level(record.level()), module, record.args());
            let _ = io::stderr().write_all(entry.as_bytes());
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let entry = format_entry(&timestamp, record.level().as_str(), module, record.args());
                let _ = file.write_all(entry.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

fn colored_level(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1B[31mERROR\x1B[0m",
        Level::Warn => "\x1B[33mWARN \x1B[0m",
        Level::Info => "\x1B[32mINFO \x1B[0m",
        Level::Debug => "\x1B[36mDEBUG\x1B[0m",
        Level::Trace => "\x1B[90mTRACE\x1B[0m",
    }
}

fn format_entry(timestamp: &str, level: &str, module: &str, message: &std::fmt::Arguments<'_>) -> String {
    format!("[{}] {} [{}] {}\n", timestamp, level, module, message)
}

/// Configure logging with the specified level and optionally a log file
///
/// Only the first call in a process installs a logger.
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), String> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let level_filter = level_filter(level);

        let file = if let Some(path) = log_file.clone() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        result = Err(format!("Failed to create log directory: {}", e));
                        return;
                    }
                }
            }

            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    result = Err(format!("Failed to open log file: {}", e));
                    return;
                }
            }
        } else {
            None
        };

        let logger = Box::new(BlescoutLogger {
            file,
            level: level_filter,
            console_output,
        });

        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(format!("Failed to set logger: {}", e));
            return;
        }

        log::set_max_level(level_filter);

        log::info!("Logging initialized at level: {}", level);
        if let Some(path) = log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Set global debug flags for selective logging
pub fn set_debug_flags(flags: DebugFlags) {
    if let Ok(mut debug_flags) = DEBUG_FLAGS.write() {
        *debug_flags = flags;
    }
}

/// Whether debug output from `module_path` is currently wanted
pub fn should_log_debug(module_path: &str) -> bool {
    match DEBUG_FLAGS.read() {
        Ok(flags) => category_enabled(&flags, module_path),
        Err(_) => false,
    }
}

fn category_enabled(flags: &DebugFlags, module_path: &str) -> bool {
    if flags.all {
        return true;
    }
    if module_path.contains("::bluetooth") {
        return flags.scanner;
    }
    if module_path.contains("::registry") || module_path.contains("::dedup") {
        return flags.registry;
    }
    if module_path.contains("::store") {
        return flags.store;
    }
    if module_path.contains("::location") {
        return flags.location;
    }
    if module_path.contains("::orchestrator") {
        return flags.orchestrator;
    }
    false
}

/// Log a scan error at the level its category deserves
pub fn log_scan_error(error: &ScanError, context: &str) {
    match error.kind() {
        ErrorKind::MalformedEvent => log::debug!("[{}] Dropped event: {}", context, error),
        ErrorKind::HardwareUnavailable => log::error!("[{}] {}", context, error),
        ErrorKind::AuthorizationMissing | ErrorKind::Persistence | ErrorKind::Lifecycle => {
            log::warn!("[{}] {}", context, error)
        }
    }
}

/// Helper for performance logging
pub struct PerformanceLogger {
    operation: String,
    component: String,
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    pub fn new<S: Into<String>>(component: S, operation: S) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Finish timing and log result
    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        log::debug!(
            "[{}::{}] Operation completed in {:?}",
            self.component,
            self.operation,
            duration
        );
    }

    pub fn finish_with_context(self, context: &str) {
        let duration = self.start_time.elapsed();
        log::debug!(
            "[{}::{}] Operation '{}' completed in {:?}",
            self.component,
            self.operation,
            context,
            duration
        );
    }
}
