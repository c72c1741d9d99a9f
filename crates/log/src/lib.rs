//! # Custodian Log
//!
//! Subscriber bootstrap shared by every custodian binary and test harness.
//!
//! ```rust,ignore
//! let _guard = custodian_log::auto_init()?;
//! tracing::info!(poll_interval_ms = 5000, "broker starting");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard, ReloadHandle};
pub use config::{Config, DisplayConfig, Format, WriterConfig};
pub use error::{LogError, LogResult};

/// Pick a configuration from the environment and install it.
///
/// `CUSTODIAN_LOG` / `RUST_LOG` win when set; otherwise debug builds get
/// [`Config::development`] and release builds [`Config::production`].
pub fn auto_init() -> LogResult<LoggerGuard> {
    if std::env::var("CUSTODIAN_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with default configuration
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Install a test subscriber if none is installed yet.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_test() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    // Another test thread may win the race; losing it is fine.
    let _ = LoggerBuilder::from_config(Config::test()).build();
}
