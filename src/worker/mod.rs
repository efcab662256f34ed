//! The worker: one coordinator object with a handler per lifecycle event.
//!
//! Handlers can be driven by the HTTP proxy or invoked directly with
//! constructed events, which is how the tests exercise them.

mod strategies;

pub use strategies::{FetchOutcome, ResponseSource};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKind, CacheNames, CacheStore};
use crate::clients::{Client, ClientMessage, Clients};
use crate::config::Config;
use crate::http::{Destination, Request};
use crate::network::Network;
use crate::push::Notification;
use crate::router::{Router, Strategy};
use crate::sync_queue::{SyncItem, SyncQueue};

/// Sync tag that replays queued writes.
pub const DATA_SYNC_TAG: &str = "wedding-data-sync";
/// Periodic sync tag that warms recent photos into the image cache.
pub const PHOTOS_SYNC_TAG: &str = "wedding-photos-sync";

/// Shown notifications kept for status and inspection.
const MAX_NOTIFICATIONS: usize = 50;

/// Notification action that closes without navigating.
const DISMISS_ACTION: &str = "dismiss";

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Parsed,
  Installing,
  Waiting,
  Activating,
  Active,
  Redundant,
}

struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
}

/// Page-to-worker message (`{ type, data }`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SkipWaiting,
  QueueSync(QueueSyncRequest),
  ClearCache,
}

impl WorkerMessage {
  pub fn from_json(value: Value) -> Result<Self> {
    serde_json::from_value(value).map_err(|e| eyre!("Invalid worker message: {}", e))
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueSyncRequest {
  #[serde(default)]
  pub id: Option<String>,
  pub endpoint: String,
  #[serde(default)]
  pub data: Value,
}

/// Reply to a page message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MessageReply {
  SkipWaiting { activated: bool },
  Queued { id: String },
  CacheCleared { deleted: Vec<String> },
}

/// Outcome of one sync event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub tag: String,
  pub succeeded: usize,
  pub failed: usize,
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClickOutcome {
  Dismissed,
  Focused { client_id: u64 },
  Opened { url: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
  pub name: String,
  pub entries: usize,
  pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
  pub state: WorkerState,
  pub version: String,
  pub caches: Vec<CacheStatus>,
  pub queued: usize,
  pub clients: Vec<Client>,
}

/// Offline caching worker.
pub struct Worker<S: CacheStore, N: Network> {
  cache: Arc<S>,
  network: Arc<N>,
  config: Arc<Config>,
  names: CacheNames,
  router: Arc<Router>,
  queue: SyncQueue,
  clients: Clients,
  lifecycle: Arc<Mutex<Lifecycle>>,
  /// Most recent notifications shown, oldest first
  notifications: Arc<Mutex<VecDeque<Notification>>>,
}

impl<S: CacheStore, N: Network> Clone for Worker<S, N> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      network: Arc::clone(&self.network),
      config: Arc::clone(&self.config),
      names: self.names.clone(),
      router: Arc::clone(&self.router),
      queue: self.queue.clone(),
      clients: self.clients.clone(),
      lifecycle: Arc::clone(&self.lifecycle),
      notifications: Arc::clone(&self.notifications),
    }
  }
}

impl<S: CacheStore, N: Network> Worker<S, N> {
  pub fn new(
    config: Config,
    cache: S,
    network: Arc<N>,
    queue: SyncQueue,
    clients: Clients,
  ) -> Result<Self> {
    let router = Router::new(config.origin_url()?, config.routes.clone());

    Ok(Self {
      cache: Arc::new(cache),
      network,
      names: CacheNames::new(config.cache_version.clone()),
      config: Arc::new(config),
      router: Arc::new(router),
      queue,
      clients,
      lifecycle: Arc::new(Mutex::new(Lifecycle {
        state: WorkerState::Parsed,
        skip_waiting: false,
      })),
      notifications: Arc::new(Mutex::new(VecDeque::new())),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.with_lifecycle(|l| l.state)
  }

  fn set_state(&self, state: WorkerState) {
    let previous = self.with_lifecycle(|l| std::mem::replace(&mut l.state, state));
    if previous != state {
      debug!(?previous, ?state, "Worker state changed");
    }
  }

  fn with_lifecycle<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> R {
    let mut guard = self
      .lifecycle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Install, then activate straight away if skip-waiting was requested.
  pub async fn start(&self) -> Result<()> {
    self.on_install().await?;

    if self.with_lifecycle(|l| l.skip_waiting) {
      self.on_activate().await?;
    }

    Ok(())
  }

  /// Skip the waiting phase once installed.
  pub fn skip_waiting(&self) {
    self.with_lifecycle(|l| l.skip_waiting = true);
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Pre-populate the static cache. All assets are fetched before any is
  /// stored, so a failed install leaves the cache untouched.
  pub async fn on_install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(count) => {
        info!(count, version = %self.config.cache_version, "Installed");
        self.set_state(WorkerState::Waiting);
        self.skip_waiting();
        Ok(())
      }
      Err(e) => {
        error!(error = %e, "Install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let name = self.names.name(CacheKind::Static);

    let requests = self
      .config
      .precache
      .iter()
      .map(|path| Ok(Request::get(self.config.resolve(path)?)))
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;

      if !response.ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }

      Ok((request, response))
    });

    let fetched = futures::future::try_join_all(fetches).await?;

    self.cache.open(&name)?;
    for (request, response) in &fetched {
      self.cache.put(&name, request, response)?;
    }

    Ok(fetched.len())
  }

  /// Delete every cache that is not one of the current generation and take
  /// control of open pages. Returns the deleted cache names.
  pub async fn on_activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    match self.collect_stale_caches() {
      Ok(deleted) => {
        let claimed = self.clients.claim();
        self.set_state(WorkerState::Active);
        info!(?deleted, claimed, "Activated");

        self.clients.broadcast(ClientMessage::Activated {
          version: self.config.cache_version.clone(),
        });
        Ok(deleted)
      }
      Err(e) => {
        error!(error = %e, "Activation failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  fn collect_stale_caches(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.cache.keys()? {
      if !self.names.is_current(&name) && self.cache.delete(&name)? {
        debug!(cache = %name, "Deleted stale cache");
        deleted.push(name);
      }
    }

    for name in self.names.all() {
      self.cache.open(&name)?;
    }

    Ok(deleted)
  }

  // ==========================================================================
  // Fetch
  // ==========================================================================

  /// Handle an intercepted request.
  ///
  /// Requests the worker does not handle (not active yet, non-GET,
  /// cross-origin) go straight to the network.
  pub async fn on_fetch(&self, request: Request) -> Result<FetchOutcome> {
    if self.state() != WorkerState::Active {
      return self.passthrough(&request).await;
    }

    let strategy = match self.router.classify(&request) {
      Some(s) => s,
      None => return self.passthrough(&request).await,
    };

    debug!(url = %request.url, ?strategy, "Handling fetch");

    match strategy {
      Strategy::NetworkFirst => self.network_first(&request).await,
      // Image assets under cache-first paths still go to the capped cache
      Strategy::CacheFirst if self.router.is_image(&request) => self.image(&request).await,
      Strategy::CacheFirst => self.cache_first(&request).await,
      Strategy::Image => self.image(&request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(&request).await,
    }
  }

  async fn passthrough(&self, request: &Request) -> Result<FetchOutcome> {
    let response = self.network.fetch(request).await?;
    Ok(FetchOutcome::network(response))
  }

  // ==========================================================================
  // Messages
  // ==========================================================================

  pub async fn on_message(&self, message: WorkerMessage) -> Result<MessageReply> {
    match message {
      WorkerMessage::SkipWaiting => {
        self.skip_waiting();
        let activated = if self.state() == WorkerState::Waiting {
          self.on_activate().await?;
          true
        } else {
          false
        };
        Ok(MessageReply::SkipWaiting { activated })
      }
      WorkerMessage::QueueSync(req) => {
        let item = self.queue.enqueue(req.id, &req.endpoint, req.data)?;
        info!(id = %item.id, endpoint = %item.endpoint, "Queued write for background sync");
        Ok(MessageReply::Queued { id: item.id })
      }
      WorkerMessage::ClearCache => {
        let deleted = self.clear_caches()?;
        Ok(MessageReply::CacheCleared { deleted })
      }
    }
  }

  /// Delete every named cache, current generation included.
  pub fn clear_caches(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.cache.keys()? {
      if self.cache.delete(&name)? {
        deleted.push(name);
      }
    }

    info!(?deleted, "Cleared all caches");
    self.clients.broadcast(ClientMessage::CacheCleared);
    Ok(deleted)
  }

  // ==========================================================================
  // Background sync
  // ==========================================================================

  pub async fn on_sync(&self, tag: &str) -> Result<SyncReport> {
    match tag {
      DATA_SYNC_TAG => self.replay_queue().await,
      PHOTOS_SYNC_TAG => self.warm_recent_photos().await,
      _ => {
        debug!(tag, "Ignoring unknown sync tag");
        Ok(SyncReport {
          tag: tag.to_string(),
          ..SyncReport::default()
        })
      }
    }
  }

  /// Replay every queued write once. Failed items stay queued for the next
  /// sync event.
  async fn replay_queue(&self) -> Result<SyncReport> {
    let mut report = SyncReport {
      tag: DATA_SYNC_TAG.to_string(),
      ..SyncReport::default()
    };

    for item in self.queue.items()? {
      match self.replay(&item).await {
        Ok(()) => {
          self.queue.remove(&item.id)?;
          self.clients.broadcast(ClientMessage::SyncComplete {
            id: item.id.clone(),
          });
          report.succeeded += 1;
        }
        Err(e) => {
          warn!(id = %item.id, endpoint = %item.endpoint, error = %e, "Replay failed, keeping item");
          report.failed += 1;
        }
      }
    }

    info!(succeeded = report.succeeded, failed = report.failed, "Data sync finished");
    Ok(report)
  }

  async fn replay(&self, item: &SyncItem) -> Result<()> {
    let request = Request::post_json(self.config.resolve(&item.endpoint)?, &item.data)?;
    let response = self.network.fetch(&request).await?;

    if !response.ok() {
      return Err(eyre!("{} responded with {}", request.url, response.status));
    }

    Ok(())
  }

  /// Fetch the recent photo list and pull each photo into the image cache.
  async fn warm_recent_photos(&self) -> Result<SyncReport> {
    let mut report = SyncReport {
      tag: PHOTOS_SYNC_TAG.to_string(),
      ..SyncReport::default()
    };

    let list = Request::get(self.config.resolve(&self.config.sync.recent_photos_endpoint)?);
    let response = self.network.fetch(&list).await?;
    if !response.ok() {
      return Err(eyre!("{} responded with {}", list.url, response.status));
    }

    for url in parse_photo_list(&response.body)? {
      let request = Request::get(self.config.resolve(&url)?).with_destination(Destination::Image);

      if !self.router.is_same_origin(&request.url) {
        debug!(url = %request.url, "Skipping cross-origin photo");
        continue;
      }

      match self.image(&request).await {
        Ok(outcome)
          if outcome.source == ResponseSource::Cache
            || (outcome.source == ResponseSource::Network && outcome.response.ok()) =>
        {
          report.succeeded += 1
        }
        Ok(_) => report.failed += 1,
        Err(e) => {
          debug!(url = %request.url, error = %e, "Photo prefetch failed");
          report.failed += 1;
        }
      }
    }

    info!(succeeded = report.succeeded, failed = report.failed, "Photo sync finished");
    Ok(report)
  }

  // ==========================================================================
  // Push
  // ==========================================================================

  /// Show a notification for a push payload.
  pub fn on_push(&self, payload: &[u8]) -> Notification {
    let notification = Notification::from_push(payload, &self.config.notifications);
    info!(title = %notification.title, "Showing notification");

    {
      let mut shown = self
        .notifications
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      if shown.len() == MAX_NOTIFICATIONS {
        shown.pop_front();
      }
      shown.push_back(notification.clone());
    }

    self.clients.broadcast(ClientMessage::Notification {
      notification: notification.clone(),
    });

    notification
  }

  /// Focus a page already showing the notification's target, or open one.
  pub fn on_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    if action == Some(DISMISS_ACTION) {
      return Ok(ClickOutcome::Dismissed);
    }

    let url = self.config.resolve(notification.target_url())?.to_string();

    match self.clients.find_by_url(&url) {
      Some(client) => {
        self.clients.focus(client.id);
        Ok(ClickOutcome::Focused {
          client_id: client.id,
        })
      }
      None => {
        self.clients.open_window(&url);
        Ok(ClickOutcome::Opened { url })
      }
    }
  }

  /// Notifications shown so far.
  pub fn notifications(&self) -> Vec<Notification> {
    self
      .notifications
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .iter()
      .cloned()
      .collect()
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn status(&self) -> Result<WorkerStatus> {
    let caches = self
      .cache
      .keys()?
      .into_iter()
      .map(|name| {
        Ok(CacheStatus {
          entries: self.cache.entries_by_age(&name)?.len(),
          bytes: self.cache.total_size(&name)?,
          name,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(WorkerStatus {
      state: self.state(),
      version: self.config.cache_version.clone(),
      caches,
      queued: self.queue.len()?,
      clients: self.clients.all(),
    })
  }
}

/// Accepts `["/a.jpg", ...]`, `[{"url": "/a.jpg"}, ...]` or
/// `{"photos": [...]}` in either form.
fn parse_photo_list(body: &[u8]) -> Result<Vec<String>> {
  let value: Value =
    serde_json::from_slice(body).map_err(|e| eyre!("Failed to parse photo list: {}", e))?;

  let items = match &value {
    Value::Array(items) => items,
    Value::Object(map) => match map.get("photos") {
      Some(Value::Array(items)) => items,
      _ => return Err(eyre!("Photo list object has no 'photos' array")),
    },
    _ => return Err(eyre!("Photo list must be an array")),
  };

  Ok(
    items
      .iter()
      .filter_map(|item| match item {
        Value::String(url) => Some(url.clone()),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(String::from),
        _ => None,
      })
      .collect(),
  )
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::http::Response;
  use crate::network::mock::MockNetwork;

  pub const ORIGIN: &str = "http://localhost:3000";

  pub type TestWorker = Worker<SqliteStorage, MockNetwork>;

  pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  pub fn get(path: &str) -> Request {
    Request::get(url::Url::parse(&url(path)).unwrap())
  }

  /// Config with a small precache manifest.
  pub fn config() -> Config {
    Config {
      precache: vec!["/offline".to_string(), "/images/placeholder.svg".to_string()],
      ..Config::default()
    }
  }

  pub fn worker_with(config: Config) -> (TestWorker, Arc<MockNetwork>) {
    let db = Database::open_in_memory().unwrap();
    let network = Arc::new(MockNetwork::new());
    network.respond(&url("/offline"), Response::new(200, "<h1>You are offline</h1>"));
    network.respond(&url("/images/placeholder.svg"), Response::new(200, "<svg/>"));

    let worker = Worker::new(
      config,
      SqliteStorage::new(db.clone()),
      network.clone(),
      SyncQueue::new(db),
      Clients::new(64),
    )
    .unwrap();

    (worker, network)
  }

  /// Installed and activated worker with the default test config.
  pub async fn active_worker() -> (TestWorker, Arc<MockNetwork>) {
    active_worker_with(config()).await
  }

  pub async fn active_worker_with(config: Config) -> (TestWorker, Arc<MockNetwork>) {
    let (worker, network) = worker_with(config);
    worker.start().await.unwrap();
    (worker, network)
  }
}
