//! One request/response transaction and its lifecycle
use crate::errors::{DispatchError, Error, ParseError, Result};
use crate::message::{split_absolute, HttpMessage, Request, Response};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Process unique flow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl FlowId {
  fn next() -> Self {
    FlowId(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
  }
  /// Numeric value.
  pub fn get(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for FlowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "flow-{}", self.0)
  }
}

/// Who sent the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  /// client socket address
  pub addr: SocketAddr,
  /// whether the client leg was TLS
  pub tls: bool,
  /// SNI presented by the client, if any
  pub sni: Option<String>,
}

/// Where a request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  /// upstream host name or IP literal
  pub host: String,
  /// upstream port
  pub port: u16,
  /// whether to speak TLS to the upstream
  pub tls: bool,
}

impl Destination {
  /// Build a destination.
  pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
    Destination {
      host: host.into(),
      port,
      tls,
    }
  }

  /// Whether `port` is the default for the scheme.
  pub fn is_default_port(&self) -> bool {
    (self.tls && self.port == 443) || (!self.tls && self.port == 80)
  }

  /// `host:port` suitable for connecting.
  pub fn addr(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Authority for a `Host` header; the port is omitted when it is the default.
  pub fn host_header(&self) -> String {
    let host = if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    };
    if self.is_default_port() {
      host
    } else {
      format!("{}:{}", host, self.port)
    }
  }
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let scheme = if self.tls { "https" } else { "http" };
    write!(f, "{}://{}", scheme, self.addr())
  }
}

/// Lifecycle position of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
  /// request parsed, hooks not yet run
  RequestPending,
  /// request hooks finished
  RequestIntercepted,
  /// request sent upstream
  Dispatched,
  /// upstream response received, response hooks not yet run
  ResponsePending,
  /// response available and final
  ResponseIntercepted,
  /// response written to the client
  Relayed,
  /// the flow ended with an error
  Failed,
}

impl FlowState {
  /// Stable name for logs.
  pub fn as_str(&self) -> &'static str {
    match self {
      FlowState::RequestPending => "request_pending",
      FlowState::RequestIntercepted => "request_intercepted",
      FlowState::Dispatched => "dispatched",
      FlowState::ResponsePending => "response_pending",
      FlowState::ResponseIntercepted => "response_intercepted",
      FlowState::Relayed => "relayed",
      FlowState::Failed => "failed",
    }
  }

  /// Whether no further transition is possible.
  pub fn is_terminal(&self) -> bool {
    matches!(self, FlowState::Relayed | FlowState::Failed)
  }

  fn can_move_to(&self, to: FlowState) -> bool {
    use FlowState::*;
    match (self, to) {
      (from, Failed) => !from.is_terminal(),
      (RequestPending, RequestIntercepted)
      | (RequestIntercepted, Dispatched)
      | (RequestIntercepted, ResponseIntercepted)
      | (Dispatched, ResponsePending)
      | (ResponsePending, ResponseIntercepted)
      | (ResponseIntercepted, Relayed) => true,
      _ => false,
    }
  }
}

impl fmt::Display for FlowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Broad class of a flow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
  /// the client sent an unparsable request
  ClientParse,
  /// the client request exceeded a size bound
  TooLarge,
  /// the upstream could not be reached
  UpstreamUnreachable,
  /// the upstream took too long
  UpstreamTimeout,
  /// the upstream broke the exchange
  UpstreamProtocol,
  /// a hook aborted the flow
  Hook,
  /// the flow exceeded its total duration
  Timeout,
  /// the client went away
  ClientDisconnected,
  /// anything else
  Internal,
}

/// Why a flow failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
  /// failure class
  pub kind: FlowErrorKind,
  /// detail
  pub message: String,
}

impl FlowError {
  /// Build a flow error.
  pub fn new(kind: FlowErrorKind, message: impl Into<String>) -> Self {
    FlowError {
      kind,
      message: message.into(),
    }
  }
}

impl From<&Error> for FlowError {
  fn from(error: &Error) -> Self {
    let kind = match error {
      Error::Parse(ParseError::HeaderTooLarge { .. } | ParseError::BodyTooLarge { .. }) => {
        FlowErrorKind::TooLarge
      }
      Error::Parse(_) => FlowErrorKind::ClientParse,
      Error::Dispatch(DispatchError::ConnectTimeout(_) | DispatchError::ResponseHeaderTimeout) => {
        FlowErrorKind::UpstreamTimeout
      }
      Error::Dispatch(e) if e.is_connect_failure() => FlowErrorKind::UpstreamUnreachable,
      Error::Dispatch(_) => FlowErrorKind::UpstreamProtocol,
      Error::Hook(_) => FlowErrorKind::Hook,
      _ => FlowErrorKind::Internal,
    };
    FlowError::new(kind, error.to_string())
  }
}

impl fmt::Display for FlowError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}: {}", self.kind, self.message)
  }
}

/// A change a hook chose to record on the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
  /// hook that made the change, if recorded from inside the pipeline
  pub hook: Option<String>,
  /// free form description
  pub description: String,
}

/// A request/response transaction.
///
/// Owned by the connection task and lent mutably to one hook at a time.
/// Cloning produces a snapshot with the same id.
#[derive(Debug, Clone)]
pub struct Flow {
  id: FlowId,
  client: ClientInfo,
  destination: Destination,
  request: Request,
  response: Option<Response>,
  state: FlowState,
  created: SystemTime,
  timestamps: Vec<(FlowState, Instant)>,
  error: Option<FlowError>,
  mutations: Vec<Mutation>,
  pub(crate) active_hook: Option<String>,
}

impl Flow {
  /// Start a flow for a freshly parsed request.
  pub fn new(client: ClientInfo, destination: Destination, request: Request) -> Self {
    Flow {
      id: FlowId::next(),
      client,
      destination,
      request,
      response: None,
      state: FlowState::RequestPending,
      created: SystemTime::now(),
      timestamps: vec![(FlowState::RequestPending, Instant::now())],
      error: None,
      mutations: Vec::new(),
      active_hook: None,
    }
  }

  /// Flow identifier.
  pub fn id(&self) -> FlowId {
    self.id
  }
  /// Client information.
  pub fn client(&self) -> &ClientInfo {
    &self.client
  }
  /// Current upstream target.
  pub fn destination(&self) -> &Destination {
    &self.destination
  }
  /// The request.
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// The request, for modification.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }
  /// The response, once one exists.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  /// The response, for modification.
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }
  /// Set the response. Done from a request hook this skips dispatch.
  pub fn set_response(&mut self, response: Response) {
    self.response = Some(response);
  }
  /// Remove the response.
  pub fn take_response(&mut self) -> Option<Response> {
    self.response.take()
  }
  /// Current state.
  pub fn state(&self) -> FlowState {
    self.state
  }
  /// Failure detail of a failed flow.
  pub fn error(&self) -> Option<&FlowError> {
    self.error.as_ref()
  }
  /// Wall clock creation time.
  pub fn created(&self) -> SystemTime {
    self.created
  }
  /// When the flow entered `state`, if it did.
  pub fn entered(&self, state: FlowState) -> Option<Instant> {
    self
      .timestamps
      .iter()
      .find(|(s, _)| *s == state)
      .map(|(_, at)| *at)
  }
  /// Every state the flow went through, in order.
  pub fn history(&self) -> impl Iterator<Item = FlowState> + '_ {
    self.timestamps.iter().map(|(s, _)| *s)
  }
  /// Recorded mutations.
  pub fn mutations(&self) -> &[Mutation] {
    &self.mutations
  }

  /// Record a mutation, attributed to the running hook.
  pub fn record_mutation(&mut self, description: impl Into<String>) {
    self.mutations.push(Mutation {
      hook: self.active_hook.clone(),
      description: description.into(),
    });
  }

  /// Re-target dispatch to `host`, keeping port and scheme, and rewrite the
  /// `Host` header and any absolute-form target to match.
  pub fn set_host(&mut self, host: impl Into<String>) {
    let host = host.into();
    let port = self.destination.port;
    let tls = self.destination.tls;
    self.set_destination(Destination::new(host, port, tls));
  }

  /// Re-target dispatch to `destination` and rewrite the request to match.
  pub fn set_destination(&mut self, destination: Destination) {
    let authority = destination.host_header();
    if let Some((scheme, _, path)) = split_absolute(self.request.target()) {
      let target = format!("{}://{}{}", scheme, authority, path);
      self.request.set_target(target);
    }
    self.request.headers_mut().set("Host", authority);
    tracing::debug!("{} re-targeted from {} to {}", self.id, self.destination, destination);
    self.destination = destination;
  }

  /// Move to `to`, rejecting transitions the lifecycle does not allow.
  pub fn transition(&mut self, to: FlowState) -> Result<()> {
    if !self.state.can_move_to(to) {
      return Err(Error::InvalidTransition {
        from: self.state.as_str(),
        to: to.as_str(),
      });
    }
    tracing::trace!("{} {} -> {}", self.id, self.state, to);
    self.state = to;
    self.timestamps.push((to, Instant::now()));
    Ok(())
  }

  /// Mark the flow failed. Failing a finished flow is ignored.
  pub fn fail(&mut self, error: FlowError) {
    if self.state.is_terminal() {
      return;
    }
    tracing::debug!("{} failed in {}: {}", self.id, self.state, error);
    self.state = FlowState::Failed;
    self.timestamps.push((FlowState::Failed, Instant::now()));
    self.error = Some(error);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::Method;

  fn flow(target: &str) -> Flow {
    let client = ClientInfo {
      addr: "127.0.0.1:40000".parse().unwrap(),
      tls: false,
      sni: None,
    };
    let request = Request::new(Method::GET, target).with_header("Host", "example.com");
    Flow::new(client, Destination::new("example.com", 80, false), request)
  }

  #[test]
  fn ids_are_unique() {
    assert_ne!(flow("/").id(), flow("/").id());
  }

  #[test]
  fn normal_lifecycle() {
    let mut f = flow("/");
    for state in [
      FlowState::RequestIntercepted,
      FlowState::Dispatched,
      FlowState::ResponsePending,
      FlowState::ResponseIntercepted,
      FlowState::Relayed,
    ] {
      f.transition(state).unwrap();
    }
    assert_eq!(f.history().count(), 6);
    assert!(f.entered(FlowState::Dispatched).is_some());
    assert!(f.transition(FlowState::Failed).is_err());
  }

  #[test]
  fn short_circuit_skips_dispatch() {
    let mut f = flow("/");
    f.transition(FlowState::RequestIntercepted).unwrap();
    f.transition(FlowState::ResponseIntercepted).unwrap();
    assert!(f.entered(FlowState::Dispatched).is_none());
  }

  #[test]
  fn illegal_transitions_are_rejected() {
    let mut f = flow("/");
    let err = f.transition(FlowState::Relayed).unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: "request_pending", to: "relayed" }));
  }

  #[test]
  fn failure_is_terminal() {
    let mut f = flow("/");
    f.fail(FlowError::new(FlowErrorKind::Hook, "boom"));
    assert_eq!(f.state(), FlowState::Failed);
    assert_eq!(f.error().map(|e| e.kind), Some(FlowErrorKind::Hook));
    assert!(f.transition(FlowState::RequestIntercepted).is_err());
  }

  #[test]
  fn set_host_rewrites_header_and_destination() {
    let mut f = flow("/wiki");
    f.set_host("en.wikipedia.org");
    assert_eq!(f.destination().host, "en.wikipedia.org");
    assert_eq!(f.request().headers().get("host"), Some("en.wikipedia.org"));

    let mut f = flow("http://example.com:8080/x");
    f.set_destination(Destination::new("other.test", 8080, false));
    assert_eq!(f.request().target(), "http://other.test:8080/x");
    assert_eq!(f.request().headers().get("host"), Some("other.test:8080"));
  }

  #[test]
  fn mutations_are_attributed() {
    let mut f = flow("/");
    f.active_hook = Some("rewrite".into());
    f.record_mutation("changed path");
    assert_eq!(f.mutations()[0].hook.as_deref(), Some("rewrite"));
  }
}
