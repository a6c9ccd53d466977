//! Push messages projected into user-facing alerts.
//!
//! Rendering belongs to the shell; this module only decides which kinds
//! deserve an alert and what it says.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{Envelope, ResourceId};
use crate::router::Subscription;
use crate::session::ChannelSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub resource: Option<ResourceId>,
}

/// Suffix → (severity, verb). Longer suffixes first so `low_stock` is not
/// shadowed by anything shorter.
const RULES: &[(&str, Severity, &str)] = &[
    ("low_stock", Severity::Warning, "low stock"),
    ("created", Severity::Success, "created"),
    ("updated", Severity::Info, "updated"),
    ("deleted", Severity::Warning, "deleted"),
    ("failed", Severity::Error, "failed"),
    ("error", Severity::Error, "error"),
    ("alert", Severity::Warning, "alert"),
];

const NAME_FIELDS: &[&str] = &["name", "title", "number"];

#[derive(Debug, Clone)]
pub struct NotificationProjector {
    default_label: String,
}

impl Default for NotificationProjector {
    fn default() -> Self {
        Self::new("Record")
    }
}

impl NotificationProjector {
    /// `default_label` names the record when the kind carries no prefix.
    pub fn new(default_label: impl Into<String>) -> Self {
        Self {
            default_label: default_label.into(),
        }
    }

    /// Map one envelope to an alert, or `None` for kinds that stay silent.
    pub fn project(&self, envelope: &Envelope) -> Option<Notification> {
        let lowered = envelope.kind.to_ascii_lowercase();
        let (suffix, severity, verb) = RULES
            .iter()
            .copied()
            .find(|(suffix, _, _)| lowered.ends_with(suffix))?;

        let prefix = &envelope.kind[..envelope.kind.len() - suffix.len()];
        let label = humanize(prefix).unwrap_or_else(|| self.default_label.clone());
        let resource = envelope.resource_id();

        Some(Notification {
            kind: envelope.kind.clone(),
            severity,
            title: format!("{label} {verb}"),
            message: message_for(envelope, resource.as_ref()),
            resource,
        })
    }

    /// Project every envelope of `session` onto a channel. The stream ends
    /// when the subscription is dropped and the session is gone.
    pub fn attach(
        &self,
        session: &ChannelSession,
    ) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let projector = self.clone();
        let subscription = session.subscribe_all(move |frame: &Value| {
            let Ok(envelope) = Envelope::from_value(frame.clone()) else {
                return;
            };
            if let Some(notification) = projector.project(&envelope) {
                let _ = tx.send(notification);
            }
        });
        (subscription, rx)
    }
}

/// `purchase_order.` → `Purchase order`; `None` when nothing is left.
fn humanize(prefix: &str) -> Option<String> {
    let words: Vec<&str> = prefix
        .split(|c: char| matches!(c, '_' | '.' | ':' | '-' | ' '))
        .filter(|word| !word.is_empty())
        .collect();
    let joined = words.join(" ").to_lowercase();
    let mut chars = joined.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

fn message_for(envelope: &Envelope, resource: Option<&ResourceId>) -> String {
    if let Some(Value::String(message)) = envelope.payload.get("message") {
        return message.clone();
    }
    let item = envelope.item();
    NAME_FIELDS
        .iter()
        .find_map(|field| match item.get(*field) {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        })
        .or_else(|| resource.map(|id| format!("#{id}")))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(kind: &str, data: Value) -> Option<Notification> {
        NotificationProjector::default().project(&Envelope::with_data(kind, data))
    }

    #[test]
    fn test_crud_kinds_map_to_severities() {
        let created = project("invoice_created", json!({"id": 4, "number": "INV-4"})).unwrap();
        assert_eq!(created.severity, Severity::Success);
        assert_eq!(created.title, "Invoice created");
        assert_eq!(created.message, "INV-4");
        assert_eq!(created.resource, Some(ResourceId::Int(4)));

        let updated = project("customer.updated", json!({"id": 1, "name": "Acme"})).unwrap();
        assert_eq!(updated.severity, Severity::Info);
        assert_eq!(updated.title, "Customer updated");
        assert_eq!(updated.message, "Acme");

        let deleted = project("PURCHASE_ORDER_DELETED", json!({"id": "po-9"})).unwrap();
        assert_eq!(deleted.severity, Severity::Warning);
        assert_eq!(deleted.title, "Purchase order deleted");
        assert_eq!(deleted.message, "#po-9");
    }

    #[test]
    fn test_failure_and_stock_kinds() {
        let failed = project("payment_failed", json!({"id": 2})).unwrap();
        assert_eq!(failed.severity, Severity::Error);
        assert_eq!(failed.title, "Payment failed");

        let low = project("product_low_stock", json!({"id": 8, "name": "Bolts"})).unwrap();
        assert_eq!(low.severity, Severity::Warning);
        assert_eq!(low.title, "Product low stock");

        let alert = project("alert", json!({})).unwrap();
        assert_eq!(alert.title, "Record alert");
        assert_eq!(alert.message, "");
    }

    #[test]
    fn test_unmapped_kinds_are_silent() {
        assert!(project("stock_adjusted", json!({"id": 1})).is_none());
        assert!(project("pong", Value::Null).is_none());
    }

    #[test]
    fn test_payload_message_wins() {
        let mut payload = serde_json::Map::new();
        payload.insert("message".into(), json!("Sync job crashed"));
        payload.insert("data".into(), json!({"id": 3, "name": "nightly"}));
        let envelope = Envelope::new("job_error", payload);

        let note = NotificationProjector::new("Job").project(&envelope).unwrap();
        assert_eq!(note.message, "Sync job crashed");
        assert_eq!(note.severity, Severity::Error);
    }

    #[test]
    fn test_bare_suffix_uses_default_label() {
        let note = NotificationProjector::new("Supplier")
            .project(&Envelope::with_data("created", json!({"id": 1})))
            .unwrap();
        assert_eq!(note.title, "Supplier created");
        assert_eq!(note.message, "#1");
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("sales_order_").as_deref(), Some("Sales order"));
        assert_eq!(humanize("..").as_deref(), None);
        assert_eq!(humanize("").as_deref(), None);
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Severity::Warning).unwrap(), json!("warning"));
        assert_eq!(Severity::Success.to_string(), "success");
    }
}
