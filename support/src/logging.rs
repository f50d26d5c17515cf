use serdeconv;
use slog::Logger;
use sloggers::{Config, LoggerConfig};

use crate::config::LoggingConfig;

/// Builds the root logger from a small hardcoded default. Callers that need
/// a different sink load a `LoggingConfig` from their own TOML config file
/// and pass it to `init_with`.
pub fn init() -> Logger {
    let toml = r#"
        type = "terminal"
        level = "debug"
        destination = "stderr"
    "#;

    let config: LoggerConfig =
        serdeconv::from_toml_str(toml).expect("default logging config must parse");

    config.build_logger().expect("failed to build root logger")
}

pub fn init_with(config: &LoggingConfig) -> Logger {
    let toml = serdeconv::to_toml_string(config).expect("logging config must serialize");
    let config: LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("logging config must parse as a LoggerConfig");

    config.build_logger().expect("failed to build root logger")
}
