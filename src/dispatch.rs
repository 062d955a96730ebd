//! Upstream dispatcher
//!
//! Sends a flow's request to its destination and reads back the complete
//! response. Keep-alive upstream connections are pooled per destination.
use crate::codec::{serialize_request, MessageReader, ParseLimits};
use crate::connector::Connector;
use crate::errors::{new_io_error, DispatchError, Error, ParseError};
use crate::flow::Destination;
use crate::message::{BodyFraming, HttpMessage, Request, Response};
use crate::socket::{write_all_timeout, UpstreamStream};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opt-in retrying of failed upstream exchanges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Extra attempts after the first; 0 disables retries
  pub max_attempts: u32,
  /// Also retry methods that are not idempotent
  pub allow_non_idempotent: bool,
  /// Delay before each retry, multiplied by the attempt number
  #[serde(with = "crate::config::duration_secs")]
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      max_attempts: 0,
      allow_non_idempotent: false,
      backoff: Duration::from_millis(100),
    }
  }
}

impl RetryPolicy {
  /// Whether a request with `method` may be retried at all.
  pub fn allows(&self, method: &Method) -> bool {
    self.max_attempts > 0 && (self.allow_non_idempotent || is_idempotent(method))
  }
}

fn is_idempotent(method: &Method) -> bool {
  matches!(
    *method,
    Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
  )
}

#[derive(Debug)]
struct Idle {
  stream: UpstreamStream,
  since: Instant,
}

/// Idle keep-alive upstream connections keyed by `(host, port, tls)`.
#[derive(Debug)]
pub struct ConnectionPool {
  idle: Mutex<HashMap<Destination, Vec<Idle>>>,
  max_idle_per_host: usize,
  idle_timeout: Duration,
}

impl ConnectionPool {
  /// Create a pool keeping at most `max_idle_per_host` connections per
  /// destination, each for at most `idle_timeout`.
  pub fn new(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
    ConnectionPool {
      idle: Mutex::new(HashMap::new()),
      max_idle_per_host,
      idle_timeout,
    }
  }

  /// Park `stream` for later reuse towards `destination`.
  pub fn put(&self, destination: &Destination, stream: UpstreamStream) {
    if self.max_idle_per_host == 0 {
      return;
    }
    let mut idle = self.idle.lock();
    let entries = idle.entry(pool_key(destination)).or_default();
    entries.retain(|e| e.since.elapsed() < self.idle_timeout);
    if entries.len() >= self.max_idle_per_host {
      entries.remove(0);
    }
    entries.push(Idle {
      stream,
      since: Instant::now(),
    });
  }

  /// Take the most recently parked live connection for `destination`.
  pub fn take(&self, destination: &Destination) -> Option<UpstreamStream> {
    let key = pool_key(destination);
    let mut idle = self.idle.lock();
    let entries = idle.get_mut(&key)?;
    let mut found = None;
    while let Some(mut entry) = entries.pop() {
      if entry.since.elapsed() >= self.idle_timeout || entry.stream.is_stale() {
        tracing::trace!("dropping stale pooled connection to {}", destination);
        continue;
      }
      found = Some(entry.stream);
      break;
    }
    if entries.is_empty() {
      idle.remove(&key);
    }
    found
  }

  /// Number of idle connections parked for `destination`.
  pub fn idle_count(&self, destination: &Destination) -> usize {
    self
      .idle
      .lock()
      .get(&pool_key(destination))
      .map_or(0, |entries| entries.len())
  }

  /// Close every idle connection.
  pub fn clear(&self) {
    self.idle.lock().clear();
  }
}

fn pool_key(destination: &Destination) -> Destination {
  Destination::new(
    destination.host.to_ascii_lowercase(),
    destination.port,
    destination.tls,
  )
}

/// How an exchange on one connection ended badly.
struct Failed {
  error: DispatchError,
  /// bytes of response received before the failure
  received: usize,
}

/// Sends requests upstream and reads their responses.
#[derive(Clone, Debug)]
pub struct Dispatcher {
  connector: Connector,
  pool: Arc<ConnectionPool>,
  limits: ParseLimits,
  response_header_timeout: Duration,
  retry: RetryPolicy,
}

impl Dispatcher {
  /// Create a dispatcher.
  pub fn new(
    connector: Connector,
    pool: Arc<ConnectionPool>,
    limits: ParseLimits,
    response_header_timeout: Duration,
    retry: RetryPolicy,
  ) -> Self {
    Dispatcher {
      connector,
      pool,
      limits,
      response_header_timeout,
      retry,
    }
  }

  /// The upstream connection pool.
  pub fn pool(&self) -> &Arc<ConnectionPool> {
    &self.pool
  }

  /// The connector used for fresh connections.
  pub fn connector(&self) -> &Connector {
    &self.connector
  }

  /// Send `request` to `destination` and return the complete response.
  pub async fn dispatch(
    &self,
    request: &Request,
    destination: &Destination,
  ) -> Result<Response, DispatchError> {
    let outgoing = upstream_form(request, destination);
    let wire = serialize_request(&outgoing);
    let method = outgoing.method().clone();
    let keep_alive = outgoing.wants_keep_alive();
    let mut attempt = 0u32;
    let mut replaced_stale = false;
    loop {
      let (stream, reused) = match self.pool.take(destination) {
        Some(stream) => (stream, true),
        None => match self.connector.connect(destination).await {
          Ok(stream) => (stream, false),
          Err(error) => {
            if self.should_retry(&method, &error, 0, attempt) {
              attempt += 1;
              self.backoff(attempt).await;
              continue;
            }
            return Err(error);
          }
        },
      };
      match self.exchange(stream, &wire, &method, keep_alive, destination).await {
        Ok(response) => return Ok(response),
        Err(Failed { error, received }) => {
          let closed = matches!(
            error,
            DispatchError::Io(_) | DispatchError::UpstreamResetMidResponse { .. }
          );
          if reused && closed && received == 0 && !replaced_stale && is_idempotent(&method) {
            tracing::debug!("pooled connection to {} was closed, reconnecting", destination);
            replaced_stale = true;
            continue;
          }
          if self.should_retry(&method, &error, received, attempt) {
            attempt += 1;
            self.backoff(attempt).await;
            continue;
          }
          tracing::warn!("dispatch to {} failed: {}", destination, error);
          return Err(error);
        }
      }
    }
  }

  fn should_retry(&self, method: &Method, error: &DispatchError, received: usize, attempt: u32) -> bool {
    if attempt >= self.retry.max_attempts || !self.retry.allows(method) {
      return false;
    }
    error.is_connect_failure()
      || (received == 0
        && matches!(
          error,
          DispatchError::Io(_) | DispatchError::UpstreamResetMidResponse { .. }
        ))
  }

  async fn backoff(&self, attempt: u32) {
    let delay = self.retry.backoff.saturating_mul(attempt);
    tracing::debug!("retrying upstream request, attempt {} in {:?}", attempt, delay);
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }

  async fn exchange(
    &self,
    mut stream: UpstreamStream,
    wire: &[u8],
    method: &Method,
    keep_alive: bool,
    destination: &Destination,
  ) -> Result<Response, Failed> {
    if let Err(err) = write_all_timeout(&mut stream, wire, Some(self.response_header_timeout)).await {
      return Err(Failed {
        error: DispatchError::Io(err),
        received: 0,
      });
    }

    let mut reader = MessageReader::new(stream, self.limits);
    let head = loop {
      let head = match tokio::time::timeout(
        self.response_header_timeout,
        reader.read_response_head(method),
      )
      .await
      {
        Err(_elapsed) => {
          return Err(Failed {
            error: DispatchError::ResponseHeaderTimeout,
            received: reader.received(),
          })
        }
        Ok(Err(err)) => return Err(read_failure(err, reader.received())),
        Ok(Ok(head)) => head,
      };
      if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::trace!("skipping interim {} from {}", head.status, destination);
        continue;
      }
      break head;
    };

    let framing = head.framing;
    let body = match reader.read_body(framing).await {
      Ok(body) => body,
      Err(err) => return Err(read_failure(err, reader.received())),
    };
    let response = head.into_response(body);

    let reusable = keep_alive
      && response.allows_keep_alive()
      && framing != BodyFraming::CloseDelimited
      && response.status() != StatusCode::SWITCHING_PROTOCOLS
      && reader.buffered().is_empty();
    if reusable {
      let (stream, _) = reader.into_parts();
      self.pool.put(destination, stream);
    }
    Ok(response)
  }
}

fn read_failure(err: Error, received: usize) -> Failed {
  let error = match err {
    Error::Parse(ParseError::Truncated) => DispatchError::UpstreamResetMidResponse { received },
    Error::Parse(other) => DispatchError::UpstreamParse(other),
    Error::IO(err) if received > 0 => {
      tracing::debug!("upstream read failed: {}", err);
      DispatchError::UpstreamResetMidResponse { received }
    }
    Error::IO(err) => DispatchError::Io(err),
    other => DispatchError::Io(new_io_error(std::io::ErrorKind::Other, &other.to_string())),
  };
  Failed { error, received }
}

/// Rewrite `request` the way an origin server expects it: origin-form
/// target, a `Host` header, no proxy hop-by-hop headers, framing headers in
/// agreement with the body.
pub fn upstream_form(request: &Request, destination: &Destination) -> Request {
  let mut outgoing = request.clone();
  if outgoing.is_absolute_form() {
    let path = outgoing.path().to_string();
    outgoing.set_target(path);
  }
  if !outgoing.headers().contains("host") {
    outgoing
      .headers_mut()
      .set("Host", destination.host_header());
  }
  for name in ["proxy-connection", "proxy-authorization", "keep-alive"] {
    outgoing.headers_mut().remove(name);
  }
  outgoing.prepare_for_relay();
  outgoing
}
