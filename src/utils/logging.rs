//! Conditional logging macros that check a module-level `ENABLE_LOGS` flag,
//! plus the one-time logger setup for hosts embedding the engine.
//!
//! Usage:
//! ```rust,ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_info, log_warn, log_error};
//!
//! log_info!("This will log if ENABLE_LOGS is true");
//! ```

/// Environment switch that forces debug-level output.
pub const DEBUG_ENV_VAR: &str = "PROCTORGUARD_DEBUG";

/// Macro for conditional info logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Macro for conditional warn logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Macro for conditional error logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

pub(crate) fn debug_mode_from(value: Option<&str>) -> bool {
    value
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Initialize `env_logger` (reads `RUST_LOG`). Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging() {
    let debug_mode = debug_mode_from(std::env::var(DEBUG_ENV_VAR).ok().as_deref());
    let default_level = if debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let result = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .try_init();

    if result.is_ok() {
        log::info!("proctorguard logging initialized (debug={debug_mode})");
    }
}
