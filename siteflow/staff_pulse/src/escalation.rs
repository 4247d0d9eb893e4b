//! Red-flag fan-out to oversight roles.

use std::{fmt, sync::Arc};

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    store::{
        Collaborators, Notification, NotificationError, NotificationKind, NotificationSink,
        StaffDirectory, StoreError,
    },
    task::UserId,
    telemetry::PulseTelemetry,
};

/// Title of every escalation notification.
pub const ALERT_TITLE: &str = "Performance Alert";

/// Per-recipient delivery result of one escalation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    /// Recipients reached.
    pub delivered: Vec<UserId>,
    /// Recipients that could not be reached.
    pub failed: Vec<NotificationError>,
}

impl EscalationReport {
    /// Number of recipients attempted.
    #[must_use]
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Sends "Performance Alert" notifications to every active admin and manager.
#[derive(Clone)]
pub struct EscalationNotifier {
    directory: Arc<dyn StaffDirectory>,
    notifications: Arc<dyn NotificationSink>,
    telemetry: PulseTelemetry,
}

impl fmt::Debug for EscalationNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationNotifier").finish_non_exhaustive()
    }
}

impl EscalationNotifier {
    /// Wires the notifier to the shared collaborators.
    #[must_use]
    pub fn new(collaborators: &Collaborators, telemetry: PulseTelemetry) -> Self {
        Self {
            directory: Arc::clone(&collaborators.directory),
            notifications: Arc::clone(&collaborators.notifications),
            telemetry,
        }
    }

    /// Notifies every oversight recipient concurrently.
    ///
    /// A failed delivery is logged and recorded in the report; it never
    /// stops delivery to the other recipients.
    pub async fn notify_red_flag(
        &self,
        user_name: &str,
        reason: &str,
        user_id: &str,
    ) -> Result<EscalationReport, StoreError> {
        let recipients: Vec<UserId> = self
            .directory
            .list_staff()
            .await?
            .into_iter()
            .filter(|member| member.active && member.role.is_oversight())
            .map(|member| member.id)
            .collect();

        let message = format!("{user_name} has been flagged red: {reason}");
        let deliveries = recipients.into_iter().map(|recipient| {
            let notification = Notification::new(
                recipient.clone(),
                ALERT_TITLE,
                message.clone(),
                NotificationKind::Error,
            )
            .related_to("user", user_id);
            let sink = Arc::clone(&self.notifications);
            async move { sink.send(notification).await.map(|()| recipient) }
        });

        let mut report = EscalationReport::default();
        for outcome in join_all(deliveries).await {
            match outcome {
                Ok(recipient) => report.delivered.push(recipient),
                Err(err) => {
                    tracing::warn!(recipient = %err.recipient, error = %err.message, user_id, "escalation delivery failed");
                    report.failed.push(err);
                }
            }
        }

        self.telemetry
            .emit(
                if report.failed.is_empty() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                },
                "pulse.escalation.sent",
                user_id,
                json!({
                    "user_name": user_name,
                    "reason": reason,
                    "delivered": report.delivered,
                    "failed": report.failed.iter().map(|f| &f.recipient).collect::<Vec<_>>(),
                }),
            )
            .await;
        Ok(report)
    }
}
