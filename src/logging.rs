//! 日志宏：输出带时间戳的日志到 stderr
//!
//! `debug_log!` 只有在 `UDPXYFAST_LOG=debug` 时才输出。

use std::sync::OnceLock;

/// Environment variable that enables debug output
pub const LOG_ENV: &str = "UDPXYFAST_LOG";

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether `debug_log!` lines are printed (read once per process)
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        std::env::var(LOG_ENV)
            .map(|v| v.eq_ignore_ascii_case("debug"))
            .unwrap_or(false)
    })
}

#[doc(hidden)]
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        if $crate::logging::debug_enabled() {
            eprintln!("[{}] [DEBUG] {}", $crate::logging::timestamp(), format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        eprintln!("[{}] [INFO] {}", $crate::logging::timestamp(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        eprintln!("[{}] [WARN] {}", $crate::logging::timestamp(), format!($($arg)*));
    };
}

#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        eprintln!("[{}] [ERROR] {}", $crate::logging::timestamp(), format!($($arg)*));
    };
}

pub use crate::{debug_log, error_log, info_log, warn_log};
