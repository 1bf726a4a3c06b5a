//! Log sink contract
//!
//! The engine reports through a [`LogSink`] so embeddings can route protocol
//! logs per connection. [`TracingSink`] forwards to `tracing` at the same
//! level and is the default.

use std::fmt;

pub use tracing::Level;

/// Destination for engine log records
pub trait LogSink: Send + Sync {
    /// Skip formatting when a level is filtered out
    fn enabled(&self, level: Level) -> bool {
        let _ = level;
        true
    }

    /// Emit one record
    fn write(&self, level: Level, args: fmt::Arguments<'_>);
}

/// Forwards records to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn enabled(&self, level: Level) -> bool {
        match level {
            Level::ERROR => tracing::enabled!(Level::ERROR),
            Level::WARN => tracing::enabled!(Level::WARN),
            Level::INFO => tracing::enabled!(Level::INFO),
            Level::DEBUG => tracing::enabled!(Level::DEBUG),
            _ => tracing::enabled!(Level::TRACE),
        }
    }

    fn write(&self, level: Level, args: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!("{}", args),
            Level::WARN => tracing::warn!("{}", args),
            Level::INFO => tracing::info!("{}", args),
            Level::DEBUG => tracing::debug!("{}", args),
            _ => tracing::trace!("{}", args),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn enabled(&self, _level: Level) -> bool {
        false
    }

    fn write(&self, _level: Level, _args: fmt::Arguments<'_>) {}
}

/// Log through a sink, formatting only when the level is enabled
macro_rules! ws_log {
    ($sink:expr, $level:ident, $($arg:tt)+) => {{
        let sink: &dyn $crate::log::LogSink = &*$sink;
        if sink.enabled($crate::log::Level::$level) {
            sink.write($crate::log::Level::$level, format_args!($($arg)+));
        }
    }};
}

pub(crate) use ws_log;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Collects formatted records
    #[derive(Debug, Default)]
    pub(crate) struct CaptureSink {
        pub records: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for CaptureSink {
        fn write(&self, level: Level, args: fmt::Arguments<'_>) {
            self.records.lock().push((level, args.to_string()));
        }
    }

    #[test]
    fn test_macro_skips_disabled_levels() {
        let capture = CaptureSink::default();
        let sink: &dyn LogSink = &capture;
        ws_log!(sink, DEBUG, "opened {}", 7);
        assert_eq!(
            capture.records.lock().as_slice(),
            &[(Level::DEBUG, "opened 7".to_string())]
        );

        let null: &dyn LogSink = &NullSink;
        ws_log!(null, ERROR, "{}", "dropped");
    }

    #[test]
    fn test_tracing_sink_accepts_all_levels() {
        for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
            TracingSink.write(level, format_args!("level {level}"));
        }
    }
}
