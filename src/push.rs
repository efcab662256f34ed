//! Push payload parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::NotificationConfig;

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Push message body as sent by the server. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  tag: Option<String>,
  data: Option<Value>,
  require_interaction: Option<bool>,
  actions: Option<Vec<NotificationAction>>,
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  #[serde(default)]
  pub data: Value,
  #[serde(default)]
  pub require_interaction: bool,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  /// Build a notification from a raw push payload.
  ///
  /// JSON payloads are read field by field; anything else becomes the body
  /// text under the default title.
  pub fn from_push(payload: &[u8], defaults: &NotificationConfig) -> Self {
    let parsed = match serde_json::from_slice::<PushPayload>(payload) {
      Ok(p) => p,
      Err(_) => PushPayload {
        body: Some(String::from_utf8_lossy(payload).trim().to_string()),
        ..PushPayload::default()
      },
    };

    Self {
      title: parsed
        .title
        .unwrap_or_else(|| defaults.default_title.clone()),
      body: parsed.body.unwrap_or_default(),
      icon: parsed.icon.unwrap_or_else(|| defaults.icon.clone()),
      badge: parsed.badge.unwrap_or_else(|| defaults.badge.clone()),
      tag: parsed.tag,
      data: parsed.data.unwrap_or(Value::Null),
      require_interaction: parsed.require_interaction.unwrap_or(false),
      actions: parsed.actions.unwrap_or_default(),
    }
  }

  /// Page to show when the notification is clicked.
  pub fn target_url(&self) -> &str {
    self
      .data
      .get("url")
      .and_then(Value::as_str)
      .unwrap_or("/")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_full_payload() {
    let payload = json!({
      "title": "New photos!",
      "body": "12 photos from the reception were added",
      "icon": "/icons/camera.png",
      "tag": "photos",
      "data": {"url": "/gallery"},
      "requireInteraction": true,
      "actions": [
        {"action": "view", "title": "View"},
        {"action": "dismiss", "title": "Later"}
      ]
    });

    let n = Notification::from_push(payload.to_string().as_bytes(), &NotificationConfig::default());

    assert_eq!(n.title, "New photos!");
    assert_eq!(n.icon, "/icons/camera.png");
    assert_eq!(n.badge, "/icons/badge-72x72.png");
    assert_eq!(n.tag.as_deref(), Some("photos"));
    assert!(n.require_interaction);
    assert_eq!(n.actions.len(), 2);
    assert_eq!(n.target_url(), "/gallery");
  }

  #[test]
  fn test_plain_text_payload_becomes_body() {
    let n = Notification::from_push(b"The ceremony starts in 10 minutes", &NotificationConfig::default());

    assert_eq!(n.title, "Wedding update");
    assert_eq!(n.body, "The ceremony starts in 10 minutes");
    assert_eq!(n.target_url(), "/");
    assert!(n.actions.is_empty());
  }

  #[test]
  fn test_empty_object_uses_defaults() {
    let n = Notification::from_push(b"{}", &NotificationConfig::default());
    assert_eq!(n.title, "Wedding update");
    assert_eq!(n.body, "");
    assert_eq!(n.icon, "/icons/icon-192x192.png");
  }
}
