//! Accept loop and per-connection flow handling
use crate::acceptor::Acceptor;
use crate::body::Body;
use crate::ca::CertificateManager;
use crate::codec::{serialize_response, MessageReader, RequestHead};
use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::dispatch::{ConnectionPool, Dispatcher};
use crate::errors::{new_io_error, DispatchError, Error, ParseError, Result};
use crate::flow::{ClientInfo, Destination, Flow, FlowError, FlowErrorKind, FlowState};
use crate::hook::HookPipeline;
use crate::intercept::{Interception, TlsInterceptor, TlsState};
use crate::message::{split_absolute, split_authority, BodyFraming, HttpMessage, Response};
use crate::prebuffered::Prebuffered;
use crate::socket::{write_all_timeout, ClientStream};
use crate::tls::{root_store, upstream_client_config};
use http::StatusCode;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

struct Shared {
  config: ProxyConfig,
  acceptor: Acceptor,
  interceptor: TlsInterceptor,
  dispatcher: Dispatcher,
  pipeline: HookPipeline,
}

/// Serves client connections: resolves, intercepts, runs flows.
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<Shared>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("listen_addr", &self.inner.config.listen_addr)
      .field("pipeline", &self.inner.pipeline)
      .finish_non_exhaustive()
  }
}

impl ProxyServer {
  /// Wire the components described by `config` together.
  pub fn new(config: ProxyConfig, certs: CertificateManager, pipeline: HookPipeline) -> Result<Self> {
    config.validate()?;
    let roots = root_store(&config.extra_root_pems)?;
    let client_tls = upstream_client_config(config.upstream_verification, roots)?;
    let connector = Connector::new(client_tls, config.connect_timeout, config.handshake_timeout);
    let pool = Arc::new(ConnectionPool::new(
      config.pool_max_idle_per_host,
      config.pool_idle_timeout,
    ));
    let dispatcher = Dispatcher::new(
      connector.clone(),
      pool,
      config.limits(),
      config.response_header_timeout,
      config.retry.clone(),
    );
    let interceptor = TlsInterceptor::new(
      certs,
      connector,
      config.handshake_timeout,
      config.signing_failure,
    );
    let acceptor = Acceptor::new(
      config.max_header_bytes,
      config.handshake_timeout,
      config.transparent,
    )
    .with_error_pages(config.synthetic_errors);
    Ok(ProxyServer {
      inner: Arc::new(Shared {
        config,
        acceptor,
        interceptor,
        dispatcher,
        pipeline,
      }),
    })
  }

  /// The configuration in use.
  pub fn config(&self) -> &ProxyConfig {
    &self.inner.config
  }

  /// The frozen hook pipeline.
  pub fn pipeline(&self) -> &HookPipeline {
    &self.inner.pipeline
  }

  /// Accept connections on `listener` until `shutdown` fires, then let
  /// in-flight connections drain for the shutdown grace period.
  pub async fn serve(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let limit = Arc::new(Semaphore::new(self.inner.config.max_connections));
    let mut tasks = JoinSet::new();
    tracing::info!("proxy listening on {}", listener.local_addr()?);
    loop {
      let next = async {
        let permit = limit.clone().acquire_owned().await;
        (permit, listener.accept().await)
      };
      tokio::select! {
        biased;
        _ = shutdown.recv() => break,
        Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
          if let Err(err) = joined {
            if err.is_panic() {
              tracing::error!("connection task panicked: {}", err);
            }
          }
        }
        (permit, accepted) = next => {
          let Ok(permit) = permit else { break };
          let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
              tracing::warn!("accept failed: {}", err);
              continue;
            }
          };
          let server = self.clone();
          tasks.spawn(async move {
            let _permit = permit;
            if let Err(err) = server.handle_connection(stream).await {
              tracing::debug!("connection from {} ended: {}", peer, err);
            }
          });
        }
      }
    }
    drop(listener);

    let grace = self.inner.config.shutdown_grace;
    tracing::info!("shutting down, {} connections in flight", tasks.len());
    let drained = tokio::time::timeout(grace, async {
      while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      tracing::warn!("aborting {} connections after {:?}", tasks.len(), grace);
      tasks.shutdown().await;
    }
    self.inner.dispatcher.pool().clear();
    Ok(())
  }

  /// Serve one client connection to completion.
  pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let pending = self.inner.acceptor.accept(stream).await?;
    let destination = pending.destination();
    let client = ClientInfo {
      addr: pending.peer_addr,
      tls: pending.is_tls,
      sni: pending.sni.clone(),
    };
    if !pending.is_tls {
      return self
        .serve_flows(ClientStream::Plain(pending.client), client, destination)
        .await;
    }
    if !self.inner.config.intercept_tls {
      return self.tunnel(pending.client, &destination).await;
    }

    let interception = self
      .inner
      .interceptor
      .intercept(pending.client, &destination, pending.sni.as_deref())
      .await?;
    match interception {
      Interception::PassThrough { client, .. } => self.tunnel(client, &destination).await,
      Interception::Established {
        client: tls_client,
        upstream,
        mut session,
      } => {
        self.inner.dispatcher.pool().put(&destination, upstream);
        session.transition(TlsState::Relaying)?;
        let result = self.serve_flows(tls_client, client, destination).await;
        session.transition(if result.is_ok() {
          TlsState::Closed
        } else {
          TlsState::Errored
        })?;
        result
      }
    }
  }

  /// Relay raw bytes between the client and `destination`.
  async fn tunnel(&self, mut client: Prebuffered<TcpStream>, destination: &Destination) -> Result<()> {
    let mut upstream = self.inner.dispatcher.connector().connect_tcp(destination).await?;
    tracing::debug!("tunnelling to {}", destination);
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    tracing::debug!("tunnel to {} closed ({} up, {} down)", destination, sent, received);
    Ok(())
  }

  /// Run flows over one client stream until either side ends the connection.
  async fn serve_flows(
    &self,
    stream: ClientStream,
    client: ClientInfo,
    default_destination: Destination,
  ) -> Result<()> {
    let config = &self.inner.config;
    let mut reader = MessageReader::new(stream, config.limits());
    loop {
      let head = match tokio::time::timeout(config.idle_timeout, reader.read_request_head()).await {
        Err(_elapsed) => {
          tracing::debug!("{} idle, closing", client.addr);
          return Ok(());
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(head))) => head,
        Ok(Err(err)) => return self.reject(&mut reader, err).await,
      };
      let head = self.expect_continue(&mut reader, head).await?;
      let body = match reader.read_body(head.framing).await {
        Ok(body) => body,
        Err(err) => return self.reject(&mut reader, err).await,
      };
      let request = head.into_request(body);
      let destination = destination_for(request.target(), &default_destination);
      let mut flow = Flow::new(client.clone(), destination, request);
      let client_keep_alive = flow.request().wants_keep_alive();

      let outcome =
        match tokio::time::timeout(config.flow_timeout, self.process(&mut flow, &mut reader)).await {
          Ok(outcome) => outcome,
          Err(_elapsed) => {
            flow.fail(FlowError::new(FlowErrorKind::Timeout, "flow timed out"));
            Err(new_io_error(std::io::ErrorKind::TimedOut, "flow timed out").into())
          }
        };
      let response = match outcome {
        Ok(response) => response,
        Err(err) if is_client_gone(&err) => {
          flow.fail(FlowError::new(FlowErrorKind::ClientDisconnected, err.to_string()));
          return Ok(());
        }
        Err(err) => {
          flow.fail(FlowError::from(&err));
          tracing::warn!("{} {} failed: {}", flow.id(), flow.destination(), err);
          if config.synthetic_errors {
            let page = error_page(error_status(&err, false), &err);
            write_all_timeout(reader.get_mut(), &serialize_response(&page), Some(config.flow_timeout))
              .await?;
          }
          return Err(err);
        }
      };

      let wire = serialize_response(&response);
      write_all_timeout(reader.get_mut(), &wire, Some(config.flow_timeout)).await?;
      flow.transition(FlowState::Relayed)?;
      tracing::info!(
        "{} {} {}{} -> {}",
        flow.id(),
        flow.request().method(),
        flow.destination(),
        flow.request().path(),
        response.status()
      );
      if !(client_keep_alive && response.allows_keep_alive()) {
        return Ok(());
      }
    }
  }

  /// Drive one flow from parsed request to a response ready for relay.
  async fn process(
    &self,
    flow: &mut Flow,
    reader: &mut MessageReader<ClientStream>,
  ) -> Result<Response> {
    let pipeline = &self.inner.pipeline;
    pipeline.run_request_phase(flow).await?;
    flow.transition(FlowState::RequestIntercepted)?;

    if flow.response().is_none() {
      flow.transition(FlowState::Dispatched)?;
      let dispatch = self
        .inner
        .dispatcher
        .dispatch(flow.request(), flow.destination());
      let response = tokio::select! {
        response = dispatch => response?,
        _ = reader.closed() => {
          return Err(new_io_error(std::io::ErrorKind::ConnectionAborted, "client closed during dispatch").into());
        }
      };
      flow.set_response(response);
      flow.transition(FlowState::ResponsePending)?;
    } else {
      tracing::debug!("{} answered by request hooks", flow.id());
    }

    flow.transition(FlowState::ResponseIntercepted)?;
    pipeline.run_response_phase(flow).await?;
    let mut response = flow
      .take_response()
      .ok_or_else(|| new_io_error(std::io::ErrorKind::Other, "response removed by a hook"))?;
    if flow.request().method() == http::Method::HEAD {
      response.set_body(Body::empty());
      *response.framing_mut() = BodyFraming::None;
    }
    response.prepare_for_relay();
    response
      .validate()
      .map_err(|err| Error::Dispatch(DispatchError::UpstreamParse(err)))?;
    Ok(response)
  }

  /// Answer `Expect: 100-continue` and strip it before the request is forwarded.
  async fn expect_continue(
    &self,
    reader: &mut MessageReader<ClientStream>,
    mut head: RequestHead,
  ) -> Result<RequestHead> {
    if head.headers.has_token("expect", "100-continue") {
      head.headers.remove("expect");
      if head.framing != BodyFraming::ContentLength(0) && reader.buffered().is_empty() {
        write_all_timeout(reader.get_mut(), CONTINUE, Some(self.inner.config.flow_timeout)).await?;
      }
    }
    Ok(head)
  }

  /// Answer an unreadable client request and close.
  async fn reject(&self, reader: &mut MessageReader<ClientStream>, err: Error) -> Result<()> {
    if is_client_gone(&err) {
      return Ok(());
    }
    tracing::debug!("rejecting request: {}", err);
    if self.inner.config.synthetic_errors {
      let page = error_page(error_status(&err, true), &err);
      let _ = write_all_timeout(
        reader.get_mut(),
        &serialize_response(&page),
        Some(self.inner.config.flow_timeout),
      )
      .await;
    }
    Err(err)
  }
}

/// Where a request goes: its own authority when in absolute form, else the
/// connection's destination.
fn destination_for(target: &str, default: &Destination) -> Destination {
  match split_absolute(target) {
    Some((scheme, authority, _)) => {
      let tls = scheme.eq_ignore_ascii_case("https");
      let (host, port) = split_authority(authority);
      if host.is_empty() {
        return default.clone();
      }
      Destination::new(host, port.unwrap_or(if tls { 443 } else { 80 }), tls)
    }
    None => default.clone(),
  }
}

fn is_client_gone(err: &Error) -> bool {
  match err {
    Error::Parse(ParseError::Truncated) => true,
    Error::IO(io) => matches!(
      io.kind(),
      std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
    ),
    _ => false,
  }
}

/// Status for a synthetic error page; `client_leg` errors come from the
/// client's own request.
pub(crate) fn error_status(err: &Error, client_leg: bool) -> StatusCode {
  match err {
    Error::Parse(ParseError::HeaderTooLarge { .. }) if client_leg => {
      StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
    }
    Error::Parse(ParseError::BodyTooLarge { .. }) if client_leg => StatusCode::PAYLOAD_TOO_LARGE,
    Error::Parse(_) if client_leg => StatusCode::BAD_REQUEST,
    Error::Dispatch(DispatchError::ConnectTimeout(_) | DispatchError::ResponseHeaderTimeout) => {
      StatusCode::GATEWAY_TIMEOUT
    }
    Error::IO(io) if io.kind() == std::io::ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
    _ => StatusCode::BAD_GATEWAY,
  }
}

pub(crate) fn error_page(status: StatusCode, err: &Error) -> Response {
  let body = format!(
    "{} {}\n\n{}\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or(""),
    err
  );
  Response::synthetic(status, "text/plain; charset=utf-8", body).with_header("Connection", "close")
}
