//! Logging sink for host applications
//!
//! Every line the session emits goes to `tracing`. Hosts that want the same
//! lines in their own log pipeline inject a [`Logger`]; when none is
//! injected the sink side is a no-op.

use std::fmt;
use std::sync::Arc;

/// Host-provided log sink
pub trait Logger: Send + Sync {
    fn debug(&self, tag: &str, message: &str);
    fn info(&self, tag: &str, message: &str);
    fn warn(&self, tag: &str, message: &str);
    fn error(&self, tag: &str, message: &str);
}

/// Sink that forwards into `tracing` under the `gattlink::sink` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, tag: &str, message: &str) {
        tracing::debug!(target: "gattlink::sink", tag, "{}", message);
    }

    fn info(&self, tag: &str, message: &str) {
        tracing::info!(target: "gattlink::sink", tag, "{}", message);
    }

    fn warn(&self, tag: &str, message: &str) {
        tracing::warn!(target: "gattlink::sink", tag, "{}", message);
    }

    fn error(&self, tag: &str, message: &str) {
        tracing::error!(target: "gattlink::sink", tag, "{}", message);
    }
}

/// Tagged log handle held by each component
#[derive(Clone)]
pub struct LogSink {
    tag: &'static str,
    logger: Option<Arc<dyn Logger>>,
}

impl LogSink {
    pub fn new(tag: &'static str, logger: Option<Arc<dyn Logger>>) -> Self {
        Self { tag, logger }
    }

    /// Same sink, different component tag
    pub fn with_tag(&self, tag: &'static str) -> Self {
        Self {
            tag,
            logger: self.logger.clone(),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!(tag = self.tag, "{}", message);
        if let Some(logger) = &self.logger {
            logger.debug(self.tag, message);
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(tag = self.tag, "{}", message);
        if let Some(logger) = &self.logger {
            logger.info(self.tag, message);
        }
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(tag = self.tag, "{}", message);
        if let Some(logger) = &self.logger {
            logger.warn(self.tag, message);
        }
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(tag = self.tag, "{}", message);
        if let Some(logger) = &self.logger {
            logger.error(self.tag, message);
        }
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("tag", &self.tag)
            .field("has_logger", &self.logger.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingLogger {
        lines: Mutex<Vec<(String, String, String)>>,
    }

    impl CapturingLogger {
        fn push(&self, level: &str, tag: &str, message: &str) {
            self.lines
                .lock()
                .push((level.to_string(), tag.to_string(), message.to_string()));
        }
    }

    impl Logger for CapturingLogger {
        fn debug(&self, tag: &str, message: &str) {
            self.push("d", tag, message);
        }
        fn info(&self, tag: &str, message: &str) {
            self.push("i", tag, message);
        }
        fn warn(&self, tag: &str, message: &str) {
            self.push("w", tag, message);
        }
        fn error(&self, tag: &str, message: &str) {
            self.push("e", tag, message);
        }
    }

    #[test]
    fn test_sink_forwards_level_and_tag() {
        let capture = Arc::new(CapturingLogger::default());
        let sink = LogSink::new("Test", Some(capture.clone()));

        sink.debug("one");
        sink.info(String::from("two"));
        sink.with_tag("Other").warn("three");
        sink.error(format!("{}", 4));

        let lines = capture.lines.lock();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], ("d".into(), "Test".into(), "one".into()));
        assert_eq!(lines[1].0, "i");
        assert_eq!(lines[2], ("w".into(), "Other".into(), "three".into()));
        assert_eq!(lines[3].2, "4");
    }

    #[test]
    fn test_absent_sink_is_noop() {
        let sink = LogSink::new("Quiet", None);
        sink.debug("nothing to see");
        sink.error("still nothing");
        assert_eq!(sink.tag(), "Quiet");
    }
}
