//! Logger builder implementation

mod reload;

pub use reload::ReloadHandle;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Format, WriterConfig};
use crate::error::{LogError, LogResult};

/// Logger builder
pub struct LoggerBuilder {
    config: Config,
}

/// Guard that keeps the logger alive
///
/// Holds the reload handle when the configuration asked for one.
pub struct LoggerGuard {
    reload_handle: Option<ReloadHandle>,
}

impl LoggerGuard {
    /// Handle for changing the filter at runtime, if `reloadable` was set
    pub fn reload_handle(&self) -> Option<&ReloadHandle> {
        self.reload_handle.as_ref()
    }
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if the filter string cannot be parsed or a global
    /// subscriber is already installed.
    pub fn build(self) -> LogResult<LoggerGuard> {
        let (filter_layer, reload_handle) =
            reload::filter_layer(&self.config.level, self.config.reloadable)?;

        let writer = match self.config.writer {
            WriterConfig::Stderr => BoxMakeWriter::new(std::io::stderr),
            WriterConfig::Stdout => BoxMakeWriter::new(std::io::stdout),
            WriterConfig::Test => BoxMakeWriter::new(fmt::TestWriter::new()),
        };

        let display = &self.config.display;
        let subscriber = Registry::default().with(filter_layer);

        let installed = match self.config.format {
            Format::Pretty => subscriber
                .with(
                    fmt::layer()
                        .pretty()
                        .with_writer(writer)
                        .with_ansi(display.colors)
                        .with_target(display.target)
                        .with_file(display.source)
                        .with_line_number(display.source)
                        .with_thread_ids(display.thread_ids),
                )
                .try_init(),
            Format::Compact => subscriber
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(display.colors)
                        .with_target(display.target)
                        .with_file(display.source)
                        .with_line_number(display.source)
                        .with_thread_ids(display.thread_ids),
                )
                .try_init(),
            Format::Json => subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_span_list(display.span_list)
                        .flatten_event(display.flatten)
                        .with_target(display.target)
                        .with_file(display.source)
                        .with_line_number(display.source)
                        .with_thread_ids(display.thread_ids),
                )
                .try_init(),
        };

        installed.map_err(|e| LogError::AlreadyInstalled(e.to_string()))?;

        Ok(LoggerGuard { reload_handle })
    }
}
