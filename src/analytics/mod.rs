//! Privacy-gated analytics event buffer.
//!
//! Events are appended to durable storage only while the `analytics` privacy
//! channel is enabled, and flushed to the collector with a one-way POST.
//! A failed flush leaves the buffer exactly as it was.

mod store;

pub use store::LocalStorage;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::Request;
use crate::network::Network;

pub const EVENTS_KEY: &str = "analytics:events";
pub const PREFS_KEY: &str = "privacy:prefs";
pub const SESSION_KEY: &str = "analytics:session";

/// Privacy channel that gates event collection.
pub const ANALYTICS_CHANNEL: &str = "analytics";

/// One buffered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
  #[serde(rename = "type")]
  pub event_type: String,
  pub payload: Value,
  pub timestamp: DateTime<Utc>,
}

/// Per-channel consent. Channels never set are enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivacyPrefs(BTreeMap<String, bool>);

impl PrivacyPrefs {
  pub fn is_enabled(&self, channel: &str) -> bool {
    self.0.get(channel).copied().unwrap_or(true)
  }

  pub fn set(&mut self, channel: &str, enabled: bool) {
    self.0.insert(channel.to_string(), enabled);
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub id: String,
  pub started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Batch<'a> {
  session: &'a Session,
  events: &'a [AnalyticsEvent],
  sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FlushOutcome {
  /// Nothing buffered
  Empty,
  /// Delivered and removed from the buffer
  Sent { count: usize },
  /// Delivery failed; the buffer is untouched
  Failed { retained: usize },
}

pub struct Analytics<N: Network> {
  storage: LocalStorage,
  network: Arc<N>,
  endpoint: Url,
  /// Serializes flushes so a batch is never sent twice
  flushing: tokio::sync::Mutex<()>,
}

impl<N: Network> Analytics<N> {
  pub fn new(storage: LocalStorage, network: Arc<N>, endpoint: Url) -> Self {
    Self {
      storage,
      network,
      endpoint,
      flushing: tokio::sync::Mutex::new(()),
    }
  }

  pub fn preferences(&self) -> Result<PrivacyPrefs> {
    Ok(self.storage.get_json(PREFS_KEY)?.unwrap_or_default())
  }

  /// Persist a channel preference. Disabling the analytics channel purges
  /// the buffer immediately.
  pub fn set_preference(&self, channel: &str, enabled: bool) -> Result<()> {
    let purged = self.storage.locked(|s| {
      s.update_json(PREFS_KEY, |prefs: &mut PrivacyPrefs| {
        prefs.set(channel, enabled)
      })?;

      let purge = channel == ANALYTICS_CHANNEL && !enabled;
      if purge {
        s.remove(EVENTS_KEY)?;
      }
      Ok(purge)
    })?;

    if purged {
      info!("Analytics disabled, buffer purged");
    }

    Ok(())
  }

  /// Buffer an event. Returns false when the analytics channel is disabled.
  ///
  /// The consent check and the append happen under one storage lock, so an
  /// event can never land after a purge.
  pub fn track_event(&self, event_type: &str, payload: Value) -> Result<bool> {
    let event = AnalyticsEvent {
      event_type: event_type.to_string(),
      payload,
      timestamp: Utc::now(),
    };

    let recorded = self.storage.locked(|s| {
      let prefs: PrivacyPrefs = s.get_json(PREFS_KEY)?.unwrap_or_default();
      if !prefs.is_enabled(ANALYTICS_CHANNEL) {
        return Ok(false);
      }

      s.update_json(EVENTS_KEY, |events: &mut Vec<AnalyticsEvent>| {
        events.push(event)
      })?;
      Ok(true)
    })?;

    if !recorded {
      debug!(event_type, "Analytics disabled, dropping event");
    }

    Ok(recorded)
  }

  pub fn track_page_view(&self, path: &str) -> Result<bool> {
    self.track_event("page_view", json!({ "path": path }))
  }

  /// Record an error with any `password:` value scrubbed from the message.
  pub fn track_error(&self, message: &str, context: Value) -> Result<bool> {
    self.track_event(
      "error",
      json!({ "message": scrub_secrets(message), "context": context }),
    )
  }

  /// Buffered events, oldest first.
  pub fn events(&self) -> Result<Vec<AnalyticsEvent>> {
    Ok(self.storage.get_json(EVENTS_KEY)?.unwrap_or_default())
  }

  /// Current session, created on first use.
  pub fn session(&self) -> Result<Session> {
    self.storage.locked(|s| {
      if let Some(session) = s.get_json::<Session>(SESSION_KEY)? {
        return Ok(session);
      }

      let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        started_at: Utc::now(),
      };
      s.set_json(SESSION_KEY, &session)?;
      Ok(session)
    })
  }

  /// Send the buffer to the collector.
  ///
  /// Transmission failures are reported as `FlushOutcome::Failed`, never as
  /// errors; only storage failures are errors.
  pub async fn flush_events(&self) -> Result<FlushOutcome> {
    let _flushing = self.flushing.lock().await;

    let events = self.events()?;
    if events.is_empty() {
      return Ok(FlushOutcome::Empty);
    }

    let session = self.session()?;
    let batch = Batch {
      session: &session,
      events: &events,
      sent_at: Utc::now(),
    };
    let request = Request::post_json(self.endpoint.clone(), &batch)?;

    match self.network.fetch(&request).await {
      Ok(response) if response.ok() => {
        self
          .storage
          .update_json(EVENTS_KEY, |current: &mut Vec<AnalyticsEvent>| {
            remove_flushed(current, &events)
          })?;
        info!(count = events.len(), "Flushed analytics events");
        Ok(FlushOutcome::Sent {
          count: events.len(),
        })
      }
      Ok(response) => {
        warn!(status = response.status, "Analytics collector rejected batch");
        Ok(FlushOutcome::Failed {
          retained: events.len(),
        })
      }
      Err(e) => {
        debug!(error = %e, "Analytics flush failed");
        Ok(FlushOutcome::Failed {
          retained: events.len(),
        })
      }
    }
  }

  /// Fire-and-forget flush.
  pub fn flush_in_background(self: &Arc<Self>) -> JoinHandle<()> {
    let analytics = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = analytics.flush_events().await {
        warn!(error = %e, "Background analytics flush failed");
      }
    })
  }
}

/// Drop the events that were just delivered, keeping anything buffered while
/// the flush was in flight.
fn remove_flushed(current: &mut Vec<AnalyticsEvent>, flushed: &[AnalyticsEvent]) {
  if current.starts_with(flushed) {
    current.drain(..flushed.len());
  } else {
    current.retain(|e| !flushed.contains(e));
  }
}

/// Replace the value following any `password:` (case-insensitive) with
/// `[REDACTED]`.
pub fn scrub_secrets(message: &str) -> String {
  const NEEDLE: &str = "password:";

  // ASCII lowercasing keeps byte offsets aligned with `message`
  let lower = message.to_ascii_lowercase();
  let mut out = String::with_capacity(message.len());
  let mut cursor = 0;

  while let Some(found) = lower[cursor..].find(NEEDLE) {
    let after = cursor + found + NEEDLE.len();
    out.push_str(&message[cursor..after]);

    let rest = &message[after..];
    let value_start = rest.len() - rest.trim_start().len();
    let value_len = rest[value_start..]
      .find(char::is_whitespace)
      .unwrap_or(rest.len() - value_start);

    if value_len == 0 {
      cursor = after;
      continue;
    }

    out.push_str(&rest[..value_start]);
    out.push_str("[REDACTED]");
    cursor = after + value_start + value_len;
  }

  out.push_str(&message[cursor..]);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::Response;
  use crate::network::mock::MockNetwork;

  const ENDPOINT: &str = "http://localhost:3000/analytics";

  fn analytics() -> (Analytics<MockNetwork>, Arc<MockNetwork>) {
    let network = Arc::new(MockNetwork::new());
    network.respond(ENDPOINT, Response::new(204, ""));
    let analytics = Analytics::new(
      LocalStorage::new(Database::open_in_memory().unwrap()),
      network.clone(),
      Url::parse(ENDPOINT).unwrap(),
    );
    (analytics, network)
  }

  #[test]
  fn test_track_event_buffers_in_order() {
    let (analytics, _network) = analytics();

    assert!(analytics.track_event("rsvp_opened", json!({})).unwrap());
    assert!(analytics.track_page_view("/gallery").unwrap());

    let events = analytics.events().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "rsvp_opened");
    assert_eq!(events[1].payload, json!({"path": "/gallery"}));
  }

  #[test]
  fn test_disabling_purges_and_blocks_tracking() {
    let (analytics, _network) = analytics();
    analytics.track_event("a", json!(1)).unwrap();
    analytics.track_event("b", json!(2)).unwrap();

    analytics.set_preference(ANALYTICS_CHANNEL, false).unwrap();
    assert!(analytics.events().unwrap().is_empty());

    assert!(!analytics.track_event("c", json!(3)).unwrap());
    assert!(analytics.events().unwrap().is_empty());

    analytics.set_preference(ANALYTICS_CHANNEL, true).unwrap();
    assert!(analytics.track_event("d", json!(4)).unwrap());
    assert_eq!(analytics.events().unwrap().len(), 1);
  }

  #[test]
  fn test_no_event_survives_a_concurrent_disable() {
    let (analytics, _network) = analytics();

    std::thread::scope(|scope| {
      let tracker = scope.spawn(|| {
        for n in 0..500 {
          analytics.track_event("tick", json!(n)).unwrap();
        }
      });

      while analytics.events().unwrap().is_empty() && !tracker.is_finished() {
        std::thread::yield_now();
      }
      analytics.set_preference(ANALYTICS_CHANNEL, false).unwrap();
      tracker.join().unwrap();
    });

    assert!(analytics.events().unwrap().is_empty());
  }

  #[test]
  fn test_other_channels_do_not_purge() {
    let (analytics, _network) = analytics();
    analytics.track_event("a", json!(1)).unwrap();

    analytics.set_preference("marketing", false).unwrap();

    assert_eq!(analytics.events().unwrap().len(), 1);
    let prefs = analytics.preferences().unwrap();
    assert!(!prefs.is_enabled("marketing"));
    assert!(prefs.is_enabled(ANALYTICS_CHANNEL));
  }

  #[tokio::test]
  async fn test_flush_sends_and_clears() {
    let (analytics, network) = analytics();
    analytics.track_event("a", json!({"n": 1})).unwrap();
    analytics.track_event("b", json!({"n": 2})).unwrap();

    let outcome = analytics.flush_events().await.unwrap();

    assert_eq!(outcome, FlushOutcome::Sent { count: 2 });
    assert!(analytics.events().unwrap().is_empty());

    let bodies = network.posted_bodies(ENDPOINT);
    assert_eq!(bodies.len(), 1);
    let batch: Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(batch["events"].as_array().unwrap().len(), 2);
    assert_eq!(batch["events"][0]["type"], "a");
    assert_eq!(batch["session"]["id"], json!(analytics.session().unwrap().id));
  }

  #[tokio::test]
  async fn test_flush_failure_never_loses_or_duplicates() {
    let (analytics, network) = analytics();
    analytics.track_event("a", json!(1)).unwrap();
    analytics.track_event("b", json!(2)).unwrap();
    let before = analytics.events().unwrap();

    network.set_online(false);
    for _ in 0..3 {
      assert_eq!(
        analytics.flush_events().await.unwrap(),
        FlushOutcome::Failed { retained: 2 }
      );
      assert_eq!(analytics.events().unwrap(), before);
    }

    network.set_online(true);
    assert_eq!(
      analytics.flush_events().await.unwrap(),
      FlushOutcome::Sent { count: 2 }
    );
    assert_eq!(analytics.flush_events().await.unwrap(), FlushOutcome::Empty);

    // Three failed attempts and one delivery, each carrying the same batch
    let bodies = network.posted_bodies(ENDPOINT);
    assert_eq!(bodies.len(), 4);
    for body in &bodies {
      let batch: Value = serde_json::from_slice(body).unwrap();
      assert_eq!(batch["events"].as_array().unwrap().len(), 2);
    }
  }

  #[tokio::test]
  async fn test_flush_rejected_by_collector_retains() {
    let (analytics, network) = analytics();
    network.respond(ENDPOINT, Response::new(503, "busy"));
    analytics.track_event("a", json!(1)).unwrap();

    assert_eq!(
      analytics.flush_events().await.unwrap(),
      FlushOutcome::Failed { retained: 1 }
    );
    assert_eq!(analytics.events().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_background_flush() {
    let (analytics, _network) = analytics();
    let analytics = Arc::new(analytics);
    analytics.track_event("a", json!(1)).unwrap();

    analytics.flush_in_background().await.unwrap();

    assert!(analytics.events().unwrap().is_empty());
  }

  #[test]
  fn test_remove_flushed_keeps_events_added_in_flight() {
    let event = |t: &str| AnalyticsEvent {
      event_type: t.to_string(),
      payload: json!(null),
      timestamp: Utc::now(),
    };
    let (a, b, c) = (event("a"), event("b"), event("c"));

    let mut current = vec![a.clone(), b.clone(), c.clone()];
    remove_flushed(&mut current, &[a.clone(), b.clone()]);
    assert_eq!(current, vec![c.clone()]);

    // Buffer was purged and refilled mid-flight
    let mut current = vec![c.clone()];
    remove_flushed(&mut current, &[a, b]);
    assert_eq!(current, vec![c]);
  }

  #[test]
  fn test_session_is_stable() {
    let (analytics, _network) = analytics();
    let first = analytics.session().unwrap();
    assert_eq!(analytics.session().unwrap(), first);
  }

  #[test]
  fn test_track_error_scrubs_password() {
    let (analytics, _network) = analytics();
    analytics
      .track_error("login failed for ana password: hunter2 retry", json!({"page": "/admin"}))
      .unwrap();

    let events = analytics.events().unwrap();
    assert_eq!(events[0].event_type, "error");
    assert_eq!(
      events[0].payload["message"],
      "login failed for ana password: [REDACTED] retry"
    );
  }

  #[test]
  fn test_scrub_secrets() {
    assert_eq!(scrub_secrets("no secrets here"), "no secrets here");
    assert_eq!(scrub_secrets("Password:abc"), "Password:[REDACTED]");
    assert_eq!(
      scrub_secrets("password: a and PASSWORD:  b"),
      "password: [REDACTED] and PASSWORD:  [REDACTED]"
    );
    assert_eq!(scrub_secrets("trailing password:"), "trailing password:");
    assert_eq!(scrub_secrets("café password: x"), "café password: [REDACTED]");
  }
}
