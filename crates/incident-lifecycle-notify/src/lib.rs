//! Delivery of committed status changes to people.
//!
//! The lifecycle engine only produces [`NotificationIntent`] values; this
//! crate turns them into messages and hands them to a [`Notifier`]. Delivery
//! is best-effort and never feeds back into incident state.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use incident_lifecycle_core::{format_rfc3339, LifecycleConfig, NotificationIntent};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl NotificationMessage {
    /// Renders the e-mail style message for `intent`. Incidents without a
    /// department contact go to the configured fallback address.
    #[must_use]
    pub fn render(intent: &NotificationIntent, config: &LifecycleConfig) -> Self {
        let to = intent
            .department_contact
            .as_deref()
            .map(str::trim)
            .filter(|contact| !contact.is_empty())
            .unwrap_or(&config.fallback_contact)
            .to_string();
        let department = intent.department_name.as_deref().unwrap_or("unassigned");
        let occurred_at = format_rfc3339(intent.occurred_at)
            .unwrap_or_else(|_| intent.occurred_at.to_string());

        let body = format!(
            "Incident \"{title}\" changed status.\n\n\
             Previous status: {previous}\n\
             New status: {new}\n\
             Changed by: {actor}\n\
             Department: {department}\n\
             Changed at: {occurred_at}\n\n\
             {signature}\n",
            title = intent.incident_title,
            previous = intent.previous_status.label(),
            new = intent.new_status.label(),
            actor = intent.actor_id,
            signature = config.signature,
        );

        Self {
            to,
            from: config.sender_address.clone(),
            subject: format!(
                "{} Incident status updated: {}",
                config.subject_prefix, intent.incident_title
            ),
            body,
        }
    }
}

pub trait Notifier {
    #[allow(clippy::missing_errors_doc)]
    fn deliver(&self, intent: &NotificationIntent, message: &NotificationMessage) -> Result<()>;
}

/// Emits deliveries as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, intent: &NotificationIntent, message: &NotificationMessage) -> Result<()> {
        info!(
            incident_id = %intent.incident_id,
            to = %message.to,
            subject = %message.subject,
            "notification delivered to log"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct OutboxRecord<'a> {
    intent: &'a NotificationIntent,
    message: &'a NotificationMessage,
}

/// Appends one JSON line per delivery to a file picked up by a mail relay.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for OutboxNotifier {
    fn deliver(&self, intent: &NotificationIntent, message: &NotificationMessage) -> Result<()> {
        let line = serde_json::to_string(&OutboxRecord { intent, message })
            .context("failed to serialize outbox record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open outbox at {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to outbox at {}", self.path.display()))?;
        info!(
            incident_id = %intent.incident_id,
            outbox = %self.path.display(),
            "notification queued in outbox"
        );
        Ok(())
    }
}

/// Renders and delivers `intent`, logging instead of returning failures.
/// Returns whether the notifier accepted the message.
pub fn dispatch_best_effort(
    notifier: &dyn Notifier,
    intent: &NotificationIntent,
    config: &LifecycleConfig,
) -> bool {
    let message = NotificationMessage::render(intent, config);
    match notifier.deliver(intent, &message) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                incident_id = %intent.incident_id,
                error = %format!("{err:#}"),
                "notification delivery failed; state change stands"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incident_lifecycle_core::{
        parse_rfc3339_utc, DepartmentId, IncidentId, IncidentStatus, PrincipalId,
    };
    use ulid::Ulid;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_intent(contact: Option<&str>) -> NotificationIntent {
        NotificationIntent {
            incident_id: IncidentId::new(),
            incident_title: "Broken hydrant".to_string(),
            previous_status: IncidentStatus::Completed,
            new_status: IncidentStatus::Rejected,
            actor_id: must_ok(PrincipalId::new("territorial-1")),
            department_id: contact.map(|_| DepartmentId::new()),
            department_name: contact.map(|_| "Water Services".to_string()),
            department_contact: contact.map(str::to_string),
            occurred_at: must_ok(parse_rfc3339_utc("2026-05-04T15:00:00Z")),
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn deliver(&self, _: &NotificationIntent, _: &NotificationMessage) -> Result<()> {
            Err(anyhow::anyhow!("smtp relay unavailable"))
        }
    }

    #[test]
    fn render_addresses_department_contact() {
        let config = LifecycleConfig::v1();
        let message =
            NotificationMessage::render(&fixture_intent(Some("water@city.example")), &config);
        assert_eq!(message.to, "water@city.example");
        assert_eq!(message.from, "no-reply@municipalidad.local");
        assert_eq!(
            message.subject,
            "[Incidents] Incident status updated: Broken hydrant"
        );
        assert!(message.body.contains("Previous status: Completed"));
        assert!(message.body.contains("New status: Rejected"));
        assert!(message.body.contains("Changed by: territorial-1"));
        assert!(message.body.contains("Department: Water Services"));
        assert!(message.body.contains("2026-05-04T15:00:00Z"));
    }

    #[test]
    fn render_falls_back_when_department_has_no_contact() {
        let config = LifecycleConfig::v1();
        let message = NotificationMessage::render(&fixture_intent(None), &config);
        assert_eq!(message.to, "soporte@municipalidad.local");
        assert!(message.body.contains("Department: unassigned"));
    }

    #[test]
    fn outbox_appends_one_json_line_per_delivery() {
        let path = std::env::temp_dir().join(format!("incident-outbox-{}.jsonl", Ulid::new()));
        let notifier = OutboxNotifier::new(&path);
        let config = LifecycleConfig::v1();
        let first = fixture_intent(Some("water@city.example"));
        let second = fixture_intent(None);
        assert!(dispatch_best_effort(&notifier, &first, &config));
        assert!(dispatch_best_effort(&notifier, &second, &config));

        let contents = must_ok(std::fs::read_to_string(notifier.path()));
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| must_ok(serde_json::from_str(line)))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["intent"]["new_status"], "rejected");
        assert_eq!(lines[0]["message"]["to"], "water@city.example");
        assert_eq!(lines[1]["message"]["to"], "soporte@municipalidad.local");
        assert_eq!(lines[1]["intent"]["occurred_at"], "2026-05-04T15:00:00Z");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_delivery_is_swallowed() {
        let config = LifecycleConfig::v1();
        assert!(!dispatch_best_effort(
            &FailingNotifier,
            &fixture_intent(None),
            &config
        ));
        assert!(dispatch_best_effort(&LogNotifier, &fixture_intent(None), &config));

        let missing_dir = std::env::temp_dir()
            .join(format!("missing-{}", Ulid::new()))
            .join("outbox.jsonl");
        assert!(!dispatch_best_effort(
            &OutboxNotifier::new(missing_dir),
            &fixture_intent(None),
            &config
        ));
    }
}
