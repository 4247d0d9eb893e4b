use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Component name stamped on every record.
pub const COMPONENT: &str = "staff_pulse";

/// Builder for [`PulseTelemetry`].
pub struct PulseTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PulseTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the handle, opening the log file if one was set.
    pub fn build(self) -> Result<PulseTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?),
            None => None,
        };
        Ok(PulseTelemetry {
            inner: Arc::new(TelemetryInner {
                component: self.component,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the controller, monitors and notifier.
///
/// Both sinks are optional; a handle with neither is a no-op.
#[derive(Clone)]
pub struct PulseTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    component: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for PulseTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulseTelemetry")
            .field("component", &self.inner.component)
            .field("logs", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl Default for PulseTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl PulseTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> PulseTelemetryBuilder {
        PulseTelemetryBuilder::new(component)
    }

    /// Handle without sinks.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: COMPONENT.to_string(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Writes one structured log line.
    pub fn log(&self, level: LogLevel, message: &str, fields: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.component, level, message).with_fields(fields);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes one event about `subject`.
    pub async fn event(&self, topic: &str, subject: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            let record = EventRecord::new(&self.inner.component, topic, payload).about(subject);
            publisher.publish(record).await?;
        }
        Ok(())
    }

    /// Logs and publishes under the same topic. Sink failures are reported
    /// through `tracing` and otherwise ignored.
    pub async fn emit(&self, level: LogLevel, topic: &str, subject: &str, payload: Value) {
        let fields = serde_json::json!({ "subject": subject, "payload": payload.clone() });
        if let Err(err) = self.log(level, topic, fields) {
            tracing::warn!(topic, error = %err, "telemetry log write failed");
        }
        if let Err(err) = self.event(topic, subject, payload).await {
            tracing::warn!(topic, error = %err, "telemetry event publish failed");
        }
    }
}
