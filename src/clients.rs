//! Open pages controlled by the worker, and messages sent to them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::push::Notification;

/// Worker-to-page message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// A new worker version took control
  Activated { version: String },
  /// A queued write was replayed
  SyncComplete { id: String },
  /// Every cache was deleted
  CacheCleared,
  /// A notification was shown
  Notification { notification: Notification },
  /// The page with this id should take focus
  Focus { client_id: u64 },
  /// A new window should be opened at this URL
  OpenWindow { url: String },
}

impl ClientMessage {
  /// Event name used on the SSE stream.
  pub fn event_name(&self) -> &'static str {
    match self {
      Self::Activated { .. } => "activated",
      Self::SyncComplete { .. } => "sync-complete",
      Self::CacheCleared => "cache-cleared",
      Self::Notification { .. } => "notification",
      Self::Focus { .. } => "focus",
      Self::OpenWindow { .. } => "open-window",
    }
  }
}

/// One open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
  pub id: u64,
  pub url: String,
  /// Whether the current worker controls this page
  pub controlled: bool,
}

#[derive(Default)]
struct Registry {
  clients: Vec<Client>,
}

/// Registry of open pages plus a broadcast channel to reach them.
#[derive(Clone)]
pub struct Clients {
  registry: Arc<Mutex<Registry>>,
  next_id: Arc<AtomicU64>,
  tx: broadcast::Sender<ClientMessage>,
}

impl Clients {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self {
      registry: Arc::new(Mutex::new(Registry::default())),
      next_id: Arc::new(AtomicU64::new(1)),
      tx,
    }
  }

  /// Register a page. The page is removed when the guard is dropped.
  pub fn register(&self, url: &str) -> ClientGuard {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.with_registry(|r| {
      r.clients.push(Client {
        id,
        url: url.to_string(),
        controlled: false,
      })
    });
    debug!(client_id = id, url, "Client registered");

    ClientGuard {
      id,
      clients: self.clone(),
    }
  }

  fn unregister(&self, id: u64) {
    self.with_registry(|r| r.clients.retain(|c| c.id != id));
    debug!(client_id = id, "Client unregistered");
  }

  /// Take control of every open page.
  pub fn claim(&self) -> usize {
    self.with_registry(|r| {
      for client in &mut r.clients {
        client.controlled = true;
      }
      r.clients.len()
    })
  }

  pub fn all(&self) -> Vec<Client> {
    self.with_registry(|r| r.clients.clone())
  }

  /// First open page showing exactly `url`.
  pub fn find_by_url(&self, url: &str) -> Option<Client> {
    self.with_registry(|r| r.clients.iter().find(|c| c.url == url).cloned())
  }

  pub fn focus(&self, client_id: u64) {
    info!(client_id, "Focusing client");
    self.broadcast(ClientMessage::Focus { client_id });
  }

  pub fn open_window(&self, url: &str) {
    info!(url, "Opening new window");
    self.broadcast(ClientMessage::OpenWindow {
      url: url.to_string(),
    });
  }

  /// Send to every subscriber, ignoring the case where none is connected.
  pub fn broadcast(&self, message: ClientMessage) {
    let _ = self.tx.send(message);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
    // A panic while holding the lock leaves the list itself consistent
    let mut guard = self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
  }
}

/// Keeps a page registered for as long as it is alive.
pub struct ClientGuard {
  id: u64,
  clients: Clients,
}

impl ClientGuard {
  pub fn id(&self) -> u64 {
    self.id
  }
}

impl Drop for ClientGuard {
  fn drop(&mut self) {
    self.clients.unregister(self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_and_drop() {
    let clients = Clients::new(16);
    let guard = clients.register("http://localhost:3000/gallery");

    assert_eq!(clients.all().len(), 1);
    assert_eq!(
      clients.find_by_url("http://localhost:3000/gallery").map(|c| c.id),
      Some(guard.id())
    );

    drop(guard);
    assert!(clients.all().is_empty());
  }

  #[test]
  fn test_claim_controls_all() {
    let clients = Clients::new(16);
    let _a = clients.register("http://localhost:3000/");
    let _b = clients.register("http://localhost:3000/rsvp");

    assert_eq!(clients.claim(), 2);
    assert!(clients.all().iter().all(|c| c.controlled));
  }

  #[test]
  fn test_broadcast_reaches_subscribers() {
    let clients = Clients::new(16);
    let mut rx = clients.subscribe();

    clients.broadcast(ClientMessage::SyncComplete { id: "x".into() });

    assert_eq!(
      rx.try_recv().unwrap(),
      ClientMessage::SyncComplete { id: "x".into() }
    );
  }

  #[test]
  fn test_broadcast_without_subscribers_is_fine() {
    Clients::new(4).broadcast(ClientMessage::CacheCleared);
  }

  #[test]
  fn test_message_serialization() {
    let json = serde_json::to_value(ClientMessage::Focus { client_id: 3 }).unwrap();
    assert_eq!(json, serde_json::json!({"type": "FOCUS", "client_id": 3}));
  }
}
