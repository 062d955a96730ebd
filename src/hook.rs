//! Request and response hooks
//!
//! Hooks are registered on a [`HookRegistry`] while the proxy is built and
//! frozen into an immutable [`HookPipeline`] when it starts. Within a phase
//! hooks run in registration order, each seeing the changes of the ones
//! before it.
use crate::errors::HookError;
use crate::flow::{Flow, FlowId};
use futures::FutureExt;
use serde::Deserialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Which side of the exchange a hook sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
  /// before dispatch
  Request,
  /// before relay to the client
  Response,
}

impl fmt::Display for HookPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HookPhase::Request => f.write_str("request"),
      HookPhase::Response => f.write_str("response"),
    }
  }
}

/// What happens to a flow when a hook returns an error or panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailurePolicy {
  /// Log the fault and run the remaining hooks.
  #[default]
  Continue,
  /// Fail the flow; the client receives a synthetic error.
  AbortFlow,
}

/// Severity of a hook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
  /// debug
  Debug,
  /// info
  Info,
  /// warn
  Warn,
  /// error
  Error,
}

/// A structured event emitted by or about a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
  /// flow the event belongs to
  pub flow_id: FlowId,
  /// hook name
  pub hook: Arc<str>,
  /// phase the hook ran in
  pub phase: HookPhase,
  /// severity
  pub level: EventLevel,
  /// message text
  pub message: String,
}

/// Destination for hook events.
pub trait EventSink: Send + Sync {
  /// Record one event.
  fn emit(&self, event: HookEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
  fn emit(&self, event: HookEvent) {
    let HookEvent {
      flow_id,
      hook,
      phase,
      level,
      message,
    } = event;
    match level {
      EventLevel::Debug => {
        tracing::debug!(flow = %flow_id, hook = %hook, phase = %phase, "{}", message)
      }
      EventLevel::Info => {
        tracing::info!(flow = %flow_id, hook = %hook, phase = %phase, "{}", message)
      }
      EventLevel::Warn => {
        tracing::warn!(flow = %flow_id, hook = %hook, phase = %phase, "{}", message)
      }
      EventLevel::Error => {
        tracing::error!(flow = %flow_id, hook = %hook, phase = %phase, "{}", message)
      }
    }
  }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
  events: parking_lot::Mutex<Vec<HookEvent>>,
}

impl MemorySink {
  /// Create an empty sink.
  pub fn new() -> Self {
    Self::default()
  }
  /// Events recorded so far.
  pub fn events(&self) -> Vec<HookEvent> {
    self.events.lock().clone()
  }
}

impl EventSink for MemorySink {
  fn emit(&self, event: HookEvent) {
    self.events.lock().push(event);
  }
}

/// Per-invocation context handed to a hook.
#[derive(Clone)]
pub struct HookContext {
  flow_id: FlowId,
  hook: Arc<str>,
  phase: HookPhase,
  sink: Arc<dyn EventSink>,
}

impl HookContext {
  /// Build a context; the pipeline does this for every invocation.
  pub fn new(flow_id: FlowId, hook: Arc<str>, phase: HookPhase, sink: Arc<dyn EventSink>) -> Self {
    HookContext {
      flow_id,
      hook,
      phase,
      sink,
    }
  }
  /// Flow being processed.
  pub fn flow_id(&self) -> FlowId {
    self.flow_id
  }
  /// Name the hook was registered under.
  pub fn hook_name(&self) -> &str {
    &self.hook
  }
  /// Current phase.
  pub fn phase(&self) -> HookPhase {
    self.phase
  }
  /// Emit an event at `level`.
  pub fn emit(&self, level: EventLevel, message: impl Into<String>) {
    self.sink.emit(HookEvent {
      flow_id: self.flow_id,
      hook: self.hook.clone(),
      phase: self.phase,
      level,
      message: message.into(),
    });
  }
  /// Emit an informational event.
  pub fn info(&self, message: impl Into<String>) {
    self.emit(EventLevel::Info, message)
  }
  /// Emit a warning event.
  pub fn warn(&self, message: impl Into<String>) {
    self.emit(EventLevel::Warn, message)
  }
}

impl fmt::Debug for HookContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookContext")
      .field("flow_id", &self.flow_id)
      .field("hook", &self.hook)
      .field("phase", &self.phase)
      .finish()
  }
}

/// Runs after a request is parsed and before it is dispatched.
#[async_trait::async_trait]
pub trait RequestHook: Send + Sync {
  /// Inspect or modify the flow. Setting a response skips dispatch.
  async fn on_request(&self, flow: &mut Flow, ctx: &HookContext) -> Result<(), HookError>;
}

/// Runs after a response is available and before it is relayed.
#[async_trait::async_trait]
pub trait ResponseHook: Send + Sync {
  /// Inspect or modify the flow's response.
  async fn on_response(&self, flow: &mut Flow, ctx: &HookContext) -> Result<(), HookError>;
}

/// Adapts a synchronous closure into a [`RequestHook`].
pub struct FnRequestHook<F>(pub F);

#[async_trait::async_trait]
impl<F> RequestHook for FnRequestHook<F>
where
  F: Fn(&mut Flow, &HookContext) -> Result<(), HookError> + Send + Sync,
{
  async fn on_request(&self, flow: &mut Flow, ctx: &HookContext) -> Result<(), HookError> {
    (self.0)(flow, ctx)
  }
}

/// Adapts a synchronous closure into a [`ResponseHook`].
pub struct FnResponseHook<F>(pub F);

#[async_trait::async_trait]
impl<F> ResponseHook for FnResponseHook<F>
where
  F: Fn(&mut Flow, &HookContext) -> Result<(), HookError> + Send + Sync,
{
  async fn on_response(&self, flow: &mut Flow, ctx: &HookContext) -> Result<(), HookError> {
    (self.0)(flow, ctx)
  }
}

struct Registration<H: ?Sized> {
  order: usize,
  name: Arc<str>,
  hook: Arc<H>,
}

impl<H: ?Sized> Clone for Registration<H> {
  fn clone(&self) -> Self {
    Registration {
      order: self.order,
      name: self.name.clone(),
      hook: self.hook.clone(),
    }
  }
}

/// Collects hooks before the proxy starts.
pub struct HookRegistry {
  request: Vec<Registration<dyn RequestHook>>,
  response: Vec<Registration<dyn ResponseHook>>,
  policy: HookFailurePolicy,
  sink: Arc<dyn EventSink>,
  next_order: usize,
}

impl Default for HookRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl HookRegistry {
  /// An empty registry logging through `tracing`.
  pub fn new() -> Self {
    HookRegistry {
      request: Vec::new(),
      response: Vec::new(),
      policy: HookFailurePolicy::default(),
      sink: Arc::new(TracingSink),
      next_order: 0,
    }
  }

  fn order(&mut self) -> usize {
    self.next_order += 1;
    self.next_order
  }

  /// Append a request hook.
  pub fn on_request(&mut self, name: impl Into<Arc<str>>, hook: impl RequestHook + 'static) {
    let order = self.order();
    self.request.push(Registration {
      order,
      name: name.into(),
      hook: Arc::new(hook),
    });
  }

  /// Append a response hook.
  pub fn on_response(&mut self, name: impl Into<Arc<str>>, hook: impl ResponseHook + 'static) {
    let order = self.order();
    self.response.push(Registration {
      order,
      name: name.into(),
      hook: Arc::new(hook),
    });
  }

  /// Append a synchronous request hook.
  pub fn on_request_fn<F>(&mut self, name: impl Into<Arc<str>>, f: F)
  where
    F: Fn(&mut Flow, &HookContext) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.on_request(name, FnRequestHook(f))
  }

  /// Append a synchronous response hook.
  pub fn on_response_fn<F>(&mut self, name: impl Into<Arc<str>>, f: F)
  where
    F: Fn(&mut Flow, &HookContext) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.on_response(name, FnResponseHook(f))
  }

  /// Set the failure policy.
  pub fn set_failure_policy(&mut self, policy: HookFailurePolicy) {
    self.policy = policy;
  }

  /// Route hook events to `sink`.
  pub fn set_sink(&mut self, sink: Arc<dyn EventSink>) {
    self.sink = sink;
  }

  /// Number of registered hooks across both phases.
  pub fn len(&self) -> usize {
    self.request.len() + self.response.len()
  }

  /// Whether no hooks are registered.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Snapshot the registrations into a shareable pipeline.
  pub fn freeze(&self) -> HookPipeline {
    HookPipeline {
      inner: Arc::new(PipelineInner {
        request: self.request.clone(),
        response: self.response.clone(),
        policy: self.policy,
        sink: self.sink.clone(),
      }),
    }
  }
}

struct PipelineInner {
  request: Vec<Registration<dyn RequestHook>>,
  response: Vec<Registration<dyn ResponseHook>>,
  policy: HookFailurePolicy,
  sink: Arc<dyn EventSink>,
}

/// Immutable, shared set of hooks.
#[derive(Clone)]
pub struct HookPipeline {
  inner: Arc<PipelineInner>,
}

impl fmt::Debug for HookPipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookPipeline")
      .field("request", &self.names(HookPhase::Request))
      .field("response", &self.names(HookPhase::Response))
      .field("policy", &self.inner.policy)
      .finish()
  }
}

impl Default for HookPipeline {
  fn default() -> Self {
    HookRegistry::new().freeze()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

impl HookPipeline {
  /// Hook names of `phase` in execution order.
  pub fn names(&self, phase: HookPhase) -> Vec<&str> {
    let mut named: Vec<(usize, &str)> = match phase {
      HookPhase::Request => self
        .inner
        .request
        .iter()
        .map(|r| (r.order, &*r.name))
        .collect(),
      HookPhase::Response => self
        .inner
        .response
        .iter()
        .map(|r| (r.order, &*r.name))
        .collect(),
    };
    named.sort_by_key(|(order, _)| *order);
    named.into_iter().map(|(_, name)| name).collect()
  }

  /// The failure policy in force.
  pub fn failure_policy(&self) -> HookFailurePolicy {
    self.inner.policy
  }

  /// Run every request hook over `flow`.
  ///
  /// Returns an error only when a hook faults under [`HookFailurePolicy::AbortFlow`].
  pub async fn run_request_phase(&self, flow: &mut Flow) -> Result<(), HookError> {
    for registration in &self.inner.request {
      let ctx = self.context(flow, &registration.name, HookPhase::Request);
      flow.active_hook = Some(registration.name.to_string());
      let outcome = AssertUnwindSafe(registration.hook.on_request(flow, &ctx))
        .catch_unwind()
        .await;
      flow.active_hook = None;
      self.settle(outcome, &ctx)?;
    }
    Ok(())
  }

  /// Run every response hook over `flow`.
  pub async fn run_response_phase(&self, flow: &mut Flow) -> Result<(), HookError> {
    for registration in &self.inner.response {
      let ctx = self.context(flow, &registration.name, HookPhase::Response);
      flow.active_hook = Some(registration.name.to_string());
      let outcome = AssertUnwindSafe(registration.hook.on_response(flow, &ctx))
        .catch_unwind()
        .await;
      flow.active_hook = None;
      self.settle(outcome, &ctx)?;
    }
    Ok(())
  }

  fn context(&self, flow: &Flow, name: &Arc<str>, phase: HookPhase) -> HookContext {
    HookContext::new(flow.id(), name.clone(), phase, self.inner.sink.clone())
  }

  fn settle(
    &self,
    outcome: std::thread::Result<Result<(), HookError>>,
    ctx: &HookContext,
  ) -> Result<(), HookError> {
    let mut error = match outcome {
      Ok(Ok(())) => return Ok(()),
      Ok(Err(error)) => error,
      Err(payload) => HookError::msg(format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    error.hook = ctx.hook_name().to_string();
    ctx.emit(EventLevel::Error, error.to_string());
    match self.inner.policy {
      HookFailurePolicy::Continue => Ok(()),
      HookFailurePolicy::AbortFlow => Err(error),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::{ClientInfo, Destination};
  use crate::message::{HttpMessage, Request, Response};
  use http::{Method, StatusCode};

  fn flow() -> Flow {
    let client = ClientInfo {
      addr: "127.0.0.1:5000".parse().unwrap(),
      tls: false,
      sni: None,
    };
    let request = Request::new(Method::GET, "/start").with_header("Host", "example.com");
    Flow::new(client, Destination::new("example.com", 80, false), request)
  }

  struct AppendPath(&'static str);

  #[async_trait::async_trait]
  impl RequestHook for AppendPath {
    async fn on_request(&self, flow: &mut Flow, _ctx: &HookContext) -> Result<(), HookError> {
      let path = format!("{}/{}", flow.request().path(), self.0);
      flow.request_mut().set_path(&path);
      Ok(())
    }
  }

  #[tokio::test]
  async fn hooks_run_in_registration_order() {
    let mut registry = HookRegistry::new();
    registry.on_request("a", AppendPath("a"));
    registry.on_request("b", AppendPath("b"));
    registry.on_request_fn("c", |flow, _| {
      let path = flow.request().path().to_string();
      flow.request_mut().headers_mut().set("X-Seen", path);
      Ok(())
    });
    let pipeline = registry.freeze();
    assert_eq!(pipeline.names(HookPhase::Request), vec!["a", "b", "c"]);
    let mut f = flow();
    pipeline.run_request_phase(&mut f).await.unwrap();
    assert_eq!(f.request().path(), "/start/a/b");
    assert_eq!(f.request().headers().get("x-seen"), Some("/start/a/b"));
  }

  #[tokio::test]
  async fn same_snapshot_gives_same_result() {
    let mut registry = HookRegistry::new();
    registry.on_request("a", AppendPath("x"));
    registry.on_response_fn("status", |flow, _| {
      if let Some(resp) = flow.response_mut() {
        resp.set_status(StatusCode::ACCEPTED);
      }
      Ok(())
    });
    let pipeline = registry.freeze();
    let mut snapshot = flow();
    snapshot.set_response(Response::new(StatusCode::OK));
    let mut first = snapshot.clone();
    let mut second = snapshot.clone();
    for f in [&mut first, &mut second] {
      pipeline.run_request_phase(f).await.unwrap();
      pipeline.run_response_phase(f).await.unwrap();
    }
    assert_eq!(first.request(), second.request());
    assert_eq!(first.response(), second.response());
    assert_eq!(first.destination(), second.destination());
  }

  #[tokio::test]
  async fn faults_are_isolated_by_default() {
    let sink = Arc::new(MemorySink::new());
    let mut registry = HookRegistry::new();
    registry.set_sink(sink.clone());
    registry.on_request_fn("fails", |_, _| Err(HookError::msg("nope")));
    registry.on_request_fn("panics", |_, _| panic!("hook blew up"));
    registry.on_request("after", AppendPath("ok"));
    let pipeline = registry.freeze();
    let mut f = flow();
    pipeline.run_request_phase(&mut f).await.unwrap();
    assert_eq!(f.request().path(), "/start/ok");
    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(&*events[0].hook, "fails");
    assert!(events[1].message.contains("hook blew up"));
    assert!(events.iter().all(|e| e.level == EventLevel::Error));
  }

  #[tokio::test]
  async fn abort_policy_stops_the_phase() {
    let mut registry = HookRegistry::new();
    registry.set_failure_policy(HookFailurePolicy::AbortFlow);
    registry.on_request_fn("fails", |_, _| Err(HookError::msg("denied")));
    registry.on_request("after", AppendPath("never"));
    let pipeline = registry.freeze();
    let mut f = flow();
    let err = pipeline.run_request_phase(&mut f).await.unwrap_err();
    assert_eq!(err.hook, "fails");
    assert_eq!(f.request().path(), "/start");
  }

  #[tokio::test]
  async fn context_reaches_the_sink() {
    let sink = Arc::new(MemorySink::new());
    let mut registry = HookRegistry::new();
    registry.set_sink(sink.clone());
    registry.on_response_fn("logger", |flow, ctx| {
      ctx.info(format!("saw {}", flow.request().path()));
      flow.record_mutation("nothing changed");
      Ok(())
    });
    let pipeline = registry.freeze();
    let mut f = flow();
    pipeline.run_response_phase(&mut f).await.unwrap();
    let events = sink.events();
    assert_eq!(events[0].flow_id, f.id());
    assert_eq!(events[0].phase, HookPhase::Response);
    assert_eq!(events[0].message, "saw /start");
    assert_eq!(f.mutations()[0].hook.as_deref(), Some("logger"));
  }
}
