//! HTTP front end: intercepts page requests for the origin and exposes the
//! worker's event surface.

use axum::{
  body::{Body, Bytes},
  extract::{Path, Query, State},
  http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response as AxumResponse,
  },
  routing::{get, post, put},
  Json, Router,
};
use color_eyre::Result;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::analytics::{Analytics, FlushOutcome, PrivacyPrefs};
use crate::cache::SqliteStorage;
use crate::http::{Destination, Request, RequestMode, Response};
use crate::network::{is_wire_header, HttpNetwork};
use crate::push::Notification;
use crate::worker::{
  ClickOutcome, MessageReply, ResponseSource, SyncReport, Worker, WorkerMessage, WorkerStatus,
};

/// Response header naming where an intercepted response came from.
const SOURCE_HEADER: &str = "x-wedding-sw-source";

pub type AppWorker = Worker<SqliteStorage, HttpNetwork>;

#[derive(Clone)]
pub struct AppState {
  pub worker: AppWorker,
  pub analytics: Arc<Analytics<HttpNetwork>>,
  pub origin: Url,
}

pub fn create_router(state: AppState) -> Router {
  Router::new()
    // Worker events
    .route("/__sw/message", post(message))
    .route("/__sw/sync/:tag", post(sync))
    .route("/__sw/push", post(push))
    .route("/__sw/notification-click", post(notification_click))
    .route("/__sw/events", get(events))
    .route("/__sw/status", get(status))
    // Analytics
    .route("/__analytics/track", post(track))
    .route("/__analytics/flush", post(flush))
    .route("/__analytics/privacy", put(privacy))
    // Everything else is a page request
    .fallback(intercept)
    .with_state(state)
}

/// JSON error body with a status code.
pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  fn bad_request(message: impl ToString) -> Self {
    Self {
      status: StatusCode::BAD_REQUEST,
      message: message.to_string(),
    }
  }
}

impl From<color_eyre::Report> for ApiError {
  fn from(err: color_eyre::Report) -> Self {
    Self {
      status: StatusCode::INTERNAL_SERVER_ERROR,
      message: err.to_string(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> AxumResponse {
    (self.status, Json(json!({ "error": self.message }))).into_response()
  }
}

// ============================================================================
// Fetch interception
// ============================================================================

async fn intercept(
  State(state): State<AppState>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> AxumResponse {
  let request = to_request(&state.origin, method, &uri, &headers, body);

  match state.worker.on_fetch(request).await {
    Ok(outcome) => {
      let mut response = to_response(outcome.response);
      response.headers_mut().insert(
        SOURCE_HEADER,
        HeaderValue::from_static(source_name(outcome.source)),
      );
      response
    }
    Err(e) => {
      warn!(uri = %uri, error = %e, "Fetch failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

/// Map an incoming proxy request onto the origin.
fn to_request(
  origin: &Url,
  method: Method,
  uri: &Uri,
  headers: &HeaderMap,
  body: Bytes,
) -> Request {
  // Only the path and query are taken from the client so the target always
  // stays on the origin
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());

  let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

  let destination = header("sec-fetch-dest")
    .map(Destination::from_header)
    .unwrap_or_default();

  let mode = match header("sec-fetch-mode") {
    Some(value) => RequestMode::from_header(value),
    None if method == Method::GET && header("accept").is_some_and(|a| a.contains("text/html")) => {
      RequestMode::Navigate
    }
    None => RequestMode::default(),
  };

  let mut request = Request::new(method, url)
    .with_destination(destination)
    .with_mode(mode);

  for (name, value) in headers {
    match value.to_str() {
      Ok(value) => request = request.with_header(name.as_str(), value),
      Err(_) => debug!(header = %name, "Dropping non-text header"),
    }
  }

  if !body.is_empty() {
    request = request.with_body(body.to_vec());
  }

  request
}

fn to_response(response: Response) -> AxumResponse {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut out = AxumResponse::new(Body::from(response.body));
  *out.status_mut() = status;

  for (name, value) in &response.headers {
    if is_wire_header(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        out.headers_mut().append(name, value);
      }
      _ => debug!(header = %name, "Skipping invalid response header"),
    }
  }

  out
}

fn source_name(source: ResponseSource) -> &'static str {
  match source {
    ResponseSource::Network => "network",
    ResponseSource::Cache => "cache",
    ResponseSource::OfflinePage => "offline-page",
    ResponseSource::Placeholder => "placeholder",
  }
}

// ============================================================================
// Worker events
// ============================================================================

async fn message(
  State(state): State<AppState>,
  Json(body): Json<Value>,
) -> Result<Json<MessageReply>, ApiError> {
  let message = WorkerMessage::from_json(body).map_err(ApiError::bad_request)?;
  Ok(Json(state.worker.on_message(message).await?))
}

async fn sync(
  State(state): State<AppState>,
  Path(tag): Path<String>,
) -> Result<Json<SyncReport>, ApiError> {
  Ok(Json(state.worker.on_sync(&tag).await?))
}

async fn push(State(state): State<AppState>, body: Bytes) -> Json<Notification> {
  Json(state.worker.on_push(&body))
}

#[derive(Deserialize)]
struct ClickRequest {
  notification: Notification,
  #[serde(default)]
  action: Option<String>,
}

async fn notification_click(
  State(state): State<AppState>,
  Json(click): Json<ClickRequest>,
) -> Result<Json<ClickOutcome>, ApiError> {
  Ok(Json(
    state
      .worker
      .on_notification_click(&click.notification, click.action.as_deref())?,
  ))
}

async fn status(State(state): State<AppState>) -> Result<Json<WorkerStatus>, ApiError> {
  Ok(Json(state.worker.status()?))
}

#[derive(Deserialize)]
struct EventsQuery {
  #[serde(default = "default_client_url")]
  url: String,
}

fn default_client_url() -> String {
  "/".to_string()
}

/// SSE stream of worker-to-page messages. The connection counts as an open
/// page for as long as it stays open.
async fn events(
  State(state): State<AppState>,
  Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
  let url = state.origin.join(&query.url).map_err(ApiError::bad_request)?;
  let clients = state.worker.clients().clone();

  let guard = clients.register(url.as_str());
  info!(client_id = guard.id(), url = %url, "Client connected");

  let stream = BroadcastStream::new(clients.subscribe()).filter_map(move |result| {
    // Unregisters the client when the stream is dropped
    let _registered = &guard;
    async move {
      match result {
        Ok(message) => Event::default()
          .event(message.event_name())
          .json_data(&message)
          .ok()
          .map(Ok),
        Err(e) => {
          warn!("SSE client lagged: {:?}", e);
          None
        }
      }
    }
  });

  Ok(
    Sse::new(stream).keep_alive(
      KeepAlive::new()
        .interval(Duration::from_secs(30))
        .text("keep-alive"),
    ),
  )
}

// ============================================================================
// Analytics
// ============================================================================

#[derive(Deserialize)]
struct TrackRequest {
  #[serde(rename = "type")]
  event_type: String,
  #[serde(default)]
  payload: Value,
}

async fn track(
  State(state): State<AppState>,
  Json(track): Json<TrackRequest>,
) -> Result<Json<Value>, ApiError> {
  let analytics = &state.analytics;

  let path = track.payload.get("path").and_then(Value::as_str);
  let message = track.payload.get("message").and_then(Value::as_str);

  let recorded = match (track.event_type.as_str(), path, message) {
    ("page_view", Some(path), _) => analytics.track_page_view(path)?,
    ("error", _, Some(message)) => {
      let context = track.payload.get("context").cloned().unwrap_or(Value::Null);
      analytics.track_error(message, context)?
    }
    (event_type, _, _) => analytics.track_event(event_type, track.payload.clone())?,
  };

  Ok(Json(json!({ "recorded": recorded })))
}

async fn flush(State(state): State<AppState>) -> Result<Json<FlushOutcome>, ApiError> {
  Ok(Json(state.analytics.flush_events().await?))
}

#[derive(Deserialize)]
struct PrivacyRequest {
  channel: String,
  enabled: bool,
}

async fn privacy(
  State(state): State<AppState>,
  Json(pref): Json<PrivacyRequest>,
) -> Result<Json<PrivacyPrefs>, ApiError> {
  state.analytics.set_preference(&pref.channel, pref.enabled)?;
  Ok(Json(state.analytics.preferences()?))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("http://localhost:3000").unwrap()
  }

  fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.insert(*name, HeaderValue::from_static(value));
    }
    map
  }

  #[test]
  fn test_to_request_maps_onto_origin() {
    let uri: Uri = "/photos/a.jpg?size=2".parse().unwrap();
    let request = to_request(
      &origin(),
      Method::GET,
      &uri,
      &headers(&[("sec-fetch-dest", "image"), ("sec-fetch-mode", "no-cors")]),
      Bytes::new(),
    );

    assert_eq!(request.url.as_str(), "http://localhost:3000/photos/a.jpg?size=2");
    assert_eq!(request.destination, Destination::Image);
    assert_eq!(request.mode, RequestMode::NoCors);
    assert!(request.body.is_none());
  }

  #[test]
  fn test_to_request_html_accept_is_navigation() {
    let uri: Uri = "/gallery".parse().unwrap();
    let request = to_request(
      &origin(),
      Method::GET,
      &uri,
      &headers(&[("accept", "text/html,application/xhtml+xml")]),
      Bytes::new(),
    );

    assert!(request.is_navigation());
  }

  #[test]
  fn test_to_request_keeps_body() {
    let uri: Uri = "/api/rsvp".parse().unwrap();
    let request = to_request(
      &origin(),
      Method::POST,
      &uri,
      &HeaderMap::new(),
      Bytes::from_static(b"{\"guests\":2}"),
    );

    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body.as_deref(), Some(&b"{\"guests\":2}"[..]));
  }

  #[test]
  fn test_to_request_scheme_relative_path_stays_on_origin() {
    let uri = Uri::builder()
      .path_and_query("//evil.example/x")
      .build()
      .unwrap();
    let request = to_request(&origin(), Method::GET, &uri, &HeaderMap::new(), Bytes::new());

    assert_eq!(request.url.host_str(), Some("localhost"));
  }

  #[test]
  fn test_to_response_copies_status_and_headers() {
    let response = Response::new(404, "missing")
      .with_header("content-type", "text/plain")
      .with_header("transfer-encoding", "chunked")
      .with_header("bad header", "x");

    let out = to_response(response);

    assert_eq!(out.status(), StatusCode::NOT_FOUND);
    assert_eq!(out.headers().get("content-type").unwrap(), "text/plain");
    assert!(out.headers().get("transfer-encoding").is_none());
  }
}
