//! Logger setup plus tracing macros gated per module.
//!
//! A module opts into verbose tracing by declaring `const ENABLE_LOGS: bool`
//! and calling `log_info!`, `log_warn!` or `log_error!` (exported at the
//! crate root). With the flag off the calls compile to nothing observable.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs `env_logger` once, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .try_init();
    });
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
