//! Settings management

mod app_config;

pub use app_config::{default_settings_path, AppConfig, LogLevel};
