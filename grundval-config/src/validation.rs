//! Cross-field validation functions for configuration structs.

use validator::ValidationError;

use crate::allocator::AllocatorConfig;
use crate::telemetry::TelemetryConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn error(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(message.into())
}

/// The initial commit must fit inside the reservation.
pub fn validate_commit_window(config: &AllocatorConfig) -> Result<(), ValidationError> {
    if config.reserve_bytes == 0 {
        return Err(error("zero_reserve", "reserve_bytes must be non-zero"));
    }
    if config.initial_commit_bytes > config.reserve_bytes {
        return Err(error(
            "commit_exceeds_reserve",
            "initial_commit_bytes must not exceed reserve_bytes",
        ));
    }
    Ok(())
}

/// Validate the default logging level.
pub fn validate_log_level(config: &TelemetryConfig) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(error(
            "invalid_log_level",
            "log_level must be one of trace, debug, info, warn, error",
        ))
    }
}
