//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include thread names.
    pub include_thread_names: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "workflowhub_sw=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_thread_names: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a debug configuration.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Create a trace configuration.
    pub fn trace() -> Self {
        Self {
            level: Level::TRACE,
            include_location: true,
            include_thread_names: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom)
                .unwrap_or_else(|_| EnvFilter::new(self.level.to_string())),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.to_string())),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn fmt_layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_thread_names(self.include_thread_names)
                .with_span_events(self.span_events())
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(self.span_events())
                .boxed(),
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_logging`] where that can happen (tests, embedding hosts).
pub fn init_logging(config: LogConfig) {
    if let Err(err) = try_init_logging(config) {
        panic!("failed to install tracing subscriber: {err}");
    }
}

/// Initialize logging, returning an error if a subscriber is already set.
pub fn try_init_logging(config: LogConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.fmt_layer(std::io::stdout))
        .with(config.env_filter())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Writer that keeps everything in memory.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(config: LogConfig, emit: impl FnOnce()) -> String {
        let out = Capture::default();
        let subscriber = tracing_subscriber::registry()
            .with(config.fmt_layer(out.clone()))
            .with(config.env_filter());
        tracing::subscriber::with_default(subscriber, emit);
        out.text()
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_production_is_json() {
        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::debug().with_filter("workflowhub_sw=trace");
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.filter.as_deref(), Some("workflowhub_sw=trace"));
    }

    #[test]
    fn test_json_format_emits_structured_fields() {
        let config = LogConfig::production().with_filter("info");
        let out = capture(config, || {
            tracing::info!(cache = "workflowhub-v1", "Deleted old cache");
        });

        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "Deleted old cache");
        assert_eq!(line["fields"]["cache"], "workflowhub-v1");
    }

    #[test]
    fn test_pretty_format_respects_filter() {
        let config = LogConfig::default().with_filter("warn");
        let out = capture(config, || {
            tracing::info!("Update check: no update");
            tracing::warn!(url = "/app.js", "Fetch failed");
        });

        assert!(out.contains("Fetch failed"));
        assert!(out.contains("/app.js"));
        assert!(!out.contains("no update"));
    }

    #[test]
    fn test_second_init_is_an_error() {
        let _ = try_init_logging(LogConfig::default().with_filter("off"));
        assert!(try_init_logging(LogConfig::default()).is_err());
    }
}
