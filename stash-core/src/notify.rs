/*!
Run notifications.

Engines report outcomes through a [`NotificationSink`]. Delivery is fire and
forget: a failing sink is logged at `warn` and never changes a run's result.
*/

use crate::config::NotificationConfig;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
        };
        f.write_str(name)
    }
}

/// One notification emitted by an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Usually the service name
    pub subject: String,
    /// `backup`, `restore` or `cleanup`
    pub operation: String,
    pub details: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        subject: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subject: subject.into(),
            operation: operation.into(),
            details: BTreeMap::new(),
            error: None,
        }
    }

    pub fn with_detail(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(name.into(), value.to_string());
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Destination for run notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Deliver a notification if a sink is configured, logging delivery failures.
pub async fn send(sink: Option<&dyn NotificationSink>, notification: Notification) {
    let Some(sink) = sink else {
        return;
    };
    if let Err(err) = sink.deliver(&notification).await {
        warn!(
            kind = %notification.kind,
            subject = %notification.subject,
            operation = %notification.operation,
            error = %err,
            "Failed to deliver notification"
        );
    }
}

/// Sink that writes notifications as structured log events.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier {
    settings: NotificationConfig,
}

impl TracingNotifier {
    pub fn new(settings: NotificationConfig) -> Self {
        Self { settings }
    }

    pub fn enabled(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Success => self.settings.on_success,
            NotificationKind::Error => self.settings.on_error,
            NotificationKind::Warning => self.settings.on_warning,
        }
    }
}

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        if !self.enabled(notification.kind) {
            return Ok(());
        }

        let details = notification
            .details
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        let failure = notification.error.as_deref().unwrap_or("");

        match notification.kind {
            NotificationKind::Success => info!(
                subject = %notification.subject,
                operation = %notification.operation,
                details = %details,
                "Notification: {} completed", notification.operation
            ),
            NotificationKind::Warning => warn!(
                subject = %notification.subject,
                operation = %notification.operation,
                details = %details,
                error = failure,
                "Notification: {} completed with warnings", notification.operation
            ),
            NotificationKind::Error => error!(
                subject = %notification.subject,
                operation = %notification.operation,
                details = %details,
                error = failure,
                "Notification: {} failed", notification.operation
            ),
        }
        Ok(())
    }
}
