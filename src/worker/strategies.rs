//! Caching strategy executors.

use color_eyre::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use crate::cache::{CacheKind, CacheStore};
use crate::config::ImageOverflowPolicy;
use crate::http::{Destination, Request, Response};
use crate::network::Network;

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from a cache
  Cache,
  /// The offline page, after network and cache both missed
  OfflinePage,
  /// The placeholder image, after network and cache both missed
  Placeholder,
}

/// Result of handling a fetch event.
#[derive(Debug)]
pub struct FetchOutcome {
  pub response: Response,
  pub source: ResponseSource,
  /// Work that outlives the response (background revalidation). Awaiting it
  /// is optional; dropping it detaches the task.
  pub wait_until: Option<JoinHandle<()>>,
}

impl FetchOutcome {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      wait_until: None,
    }
  }

  pub(crate) fn network(response: Response) -> Self {
    Self::new(response, ResponseSource::Network)
  }

  fn cache(response: Response) -> Self {
    Self::new(response, ResponseSource::Cache)
  }
}

impl<S: CacheStore, N: Network> Worker<S, N> {
  /// Network, falling back to any cached copy, then to the offline page for
  /// navigations.
  pub(crate) async fn network_first(&self, request: &Request) -> Result<FetchOutcome> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(CacheKind::Dynamic, request, &response);
        }
        Ok(FetchOutcome::network(response))
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "Network failed, trying cache");

        if let Some(cached) = self.cache.match_any(&self.names.all(), request)? {
          return Ok(FetchOutcome::cache(cached.response));
        }

        if request.is_navigation() {
          if let Some(page) = self.offline_page()? {
            info!(url = %request.url, "Serving offline page");
            return Ok(FetchOutcome::new(page, ResponseSource::OfflinePage));
          }
        }

        Err(err)
      }
    }
  }

  /// Cached copy if present, otherwise network into the static cache.
  pub(crate) async fn cache_first(&self, request: &Request) -> Result<FetchOutcome> {
    if let Some(cached) = self.cache.match_any(&self.names.all(), request)? {
      return Ok(FetchOutcome::cache(cached.response));
    }

    let response = self.network.fetch(request).await?;
    if response.ok() {
      self.store(CacheKind::Static, request, &response);
    }

    Ok(FetchOutcome::network(response))
  }

  /// Cache-first against the image cache, bounded by the byte ceiling.
  pub(crate) async fn image(&self, request: &Request) -> Result<FetchOutcome> {
    if let Some(cached) = self.cache.match_any(&self.names.all(), request)? {
      return Ok(FetchOutcome::cache(cached.response));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          if let Err(e) = self.store_image(request, &response) {
            warn!(url = %request.url, error = %e, "Failed to cache image");
          }
        }
        Ok(FetchOutcome::network(response))
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "Image fetch failed, using placeholder");

        let placeholder = Request::get(self.config.resolve(&self.config.placeholder_image)?)
          .with_destination(Destination::Image);

        if let Some(cached) = self.cache.match_any(&self.names.all(), &placeholder)? {
          return Ok(FetchOutcome::new(cached.response, ResponseSource::Placeholder));
        }

        let response = self.network.fetch(&placeholder).await.map_err(|_| err)?;
        Ok(FetchOutcome::new(response, ResponseSource::Placeholder))
      }
    }
  }

  /// Cached copy now with a background refresh, or the network if nothing is
  /// cached yet.
  pub(crate) async fn stale_while_revalidate(&self, request: &Request) -> Result<FetchOutcome> {
    if let Some(cached) = self.cache.match_any(&self.names.all(), request)? {
      let worker = self.clone();
      let request = request.clone();
      let cache_name = cached.cache_name.clone();
      let handle = tokio::spawn(async move { worker.revalidate(&cache_name, &request).await });

      return Ok(FetchOutcome {
        wait_until: Some(handle),
        ..FetchOutcome::cache(cached.response)
      });
    }

    let response = self.network.fetch(request).await?;
    if response.ok() {
      self.store(CacheKind::Dynamic, request, &response);
    }

    Ok(FetchOutcome::network(response))
  }

  /// Refresh the entry in the cache that served the hit, so the next lookup
  /// sees the new copy.
  async fn revalidate(&self, cache_name: &str, request: &Request) {
    match self.network.fetch(request).await {
      Ok(response) if response.ok() => {
        if cache_name == self.names.name(CacheKind::Image) {
          if let Err(e) = self.store_image(request, &response) {
            warn!(url = %request.url, error = %e, "Failed to cache image");
          }
        } else if let Err(e) = self.cache.put(cache_name, request, &response) {
          warn!(cache = %cache_name, url = %request.url, error = %e, "Failed to cache response");
        }
        debug!(url = %request.url, cache = %cache_name, "Revalidated");
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Revalidation got error status");
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Revalidation failed");
      }
    }
  }

  /// Put into a cache. Failures are logged and the write skipped.
  pub(crate) fn store(&self, kind: CacheKind, request: &Request, response: &Response) {
    let name = self.names.name(kind);
    if let Err(e) = self.cache.put(&name, request, response) {
      warn!(cache = %name, url = %request.url, error = %e, "Failed to cache response");
    }
  }

  /// Put into the image cache if it fits under the ceiling.
  ///
  /// Returns whether the response was stored. A response replacing an entry
  /// under the same key only counts its growth against the ceiling.
  pub(crate) fn store_image(&self, request: &Request, response: &Response) -> Result<bool> {
    let name = self.names.name(CacheKind::Image);
    let ceiling = self.config.image_cache.max_bytes;
    let size = response.size();

    if size > ceiling {
      info!(url = %request.url, size, ceiling, "Image larger than cache ceiling, not caching");
      return Ok(false);
    }

    let existing = self.cache.entry_size(&name, request)?.unwrap_or(0);
    let mut total = self.cache.total_size(&name)?.saturating_sub(existing);

    if total + size > ceiling {
      match self.config.image_cache.overflow {
        ImageOverflowPolicy::Skip => {
          info!(url = %request.url, total, size, ceiling, "Image cache full, not caching");
          return Ok(false);
        }
        ImageOverflowPolicy::EvictOldest => {
          let key = request.cache_key();
          for entry in self.cache.entries_by_age(&name)? {
            if total + size <= ceiling {
              break;
            }
            if entry.request_key == key {
              continue;
            }
            self.cache.delete_entry(&name, &entry.request_key)?;
            total = total.saturating_sub(entry.size);
            debug!(evicted = %entry.request_key, size = entry.size, "Evicted image");
          }
        }
      }
    }

    self.cache.put(&name, request, response)?;
    Ok(true)
  }

  fn offline_page(&self) -> Result<Option<Response>> {
    let request = Request::get(self.config.resolve(&self.config.offline_page)?);
    let name = self.names.name(CacheKind::Static);
    Ok(self.cache.match_request(&name, &request)?.map(|c| c.response))
  }
}
