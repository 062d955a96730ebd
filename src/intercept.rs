//! TLS interception
//!
//! Terminates the client's TLS session with a forged leaf and opens a
//! matching TLS session to the real upstream.
use crate::ca::CertificateManager;
use crate::connector::Connector;
use crate::errors::{Error, HandshakeError, Result};
use crate::flow::Destination;
use crate::prebuffered::Prebuffered;
use crate::socket::{ClientStream, UpstreamStream};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// What to do when no leaf certificate can be produced for a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsFailurePolicy {
  /// Relay the connection's raw bytes without inspection.
  PassThrough,
  /// Close the client connection.
  #[default]
  Terminate,
}

/// Position of a connection in the interception handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
  /// waiting for the client's first TLS record
  AwaitingClientHello,
  /// handshaking with the client using a forged leaf
  TerminatingClientTls,
  /// handshaking with the real upstream
  ConnectingUpstreamTls,
  /// both legs are up
  Established,
  /// plaintext is flowing through the parser
  Relaying,
  /// the connection ended normally
  Closed,
  /// the connection ended with an error
  Errored,
}

impl TlsState {
  /// Stable name for logs.
  pub fn as_str(&self) -> &'static str {
    match self {
      TlsState::AwaitingClientHello => "awaiting_client_hello",
      TlsState::TerminatingClientTls => "terminating_client_tls",
      TlsState::ConnectingUpstreamTls => "connecting_upstream_tls",
      TlsState::Established => "established",
      TlsState::Relaying => "relaying",
      TlsState::Closed => "closed",
      TlsState::Errored => "errored",
    }
  }

  /// Whether no further transition is possible.
  pub fn is_terminal(&self) -> bool {
    matches!(self, TlsState::Closed | TlsState::Errored)
  }

  fn can_move_to(&self, to: TlsState) -> bool {
    use TlsState::*;
    match (self, to) {
      (from, Errored) => !from.is_terminal(),
      (AwaitingClientHello, TerminatingClientTls)
      | (TerminatingClientTls, ConnectingUpstreamTls)
      | (ConnectingUpstreamTls, Established)
      | (Established, Relaying)
      | (Established, Closed)
      | (Relaying, Closed) => true,
      _ => false,
    }
  }
}

impl fmt::Display for TlsState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The interception state of one client connection.
#[derive(Debug, Clone)]
pub struct TlsSession {
  host: String,
  state: TlsState,
  history: Vec<TlsState>,
}

impl TlsSession {
  /// A session for `host`, awaiting the ClientHello.
  pub fn new(host: impl Into<String>) -> Self {
    TlsSession {
      host: host.into(),
      state: TlsState::AwaitingClientHello,
      history: vec![TlsState::AwaitingClientHello],
    }
  }

  /// Current state.
  pub fn state(&self) -> TlsState {
    self.state
  }

  /// States visited, in order.
  pub fn history(&self) -> &[TlsState] {
    &self.history
  }

  /// Intercepted host name.
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Move to `to`, rejecting transitions the handshake does not allow.
  pub fn transition(&mut self, to: TlsState) -> Result<()> {
    if !self.state.can_move_to(to) {
      return Err(Error::InvalidTransition {
        from: self.state.as_str(),
        to: to.as_str(),
      });
    }
    tracing::debug!("tls {} {} -> {}", self.host, self.state, to);
    self.state = to;
    self.history.push(to);
    Ok(())
  }

  fn errored(&mut self) {
    if !self.state.is_terminal() {
      tracing::debug!("tls {} {} -> {}", self.host, self.state, TlsState::Errored);
      self.state = TlsState::Errored;
      self.history.push(TlsState::Errored);
    }
  }
}

/// Result of [`TlsInterceptor::intercept`].
#[derive(Debug)]
pub enum Interception {
  /// Both legs are TLS with the proxy in the middle.
  Established {
    /// decrypted client stream
    client: ClientStream,
    /// upstream connection opened during the handshake
    upstream: UpstreamStream,
    /// handshake record, in `Established`
    session: TlsSession,
  },
  /// No leaf could be signed and the policy asks for a raw tunnel.
  /// No client bytes have been consumed.
  PassThrough {
    /// untouched client stream
    client: Prebuffered<TcpStream>,
    /// handshake record
    session: TlsSession,
  },
}

/// Drives the two TLS handshakes of an intercepted connection.
#[derive(Clone, Debug)]
pub struct TlsInterceptor {
  certs: CertificateManager,
  connector: Connector,
  handshake_timeout: Duration,
  signing_failure: TlsFailurePolicy,
}

impl TlsInterceptor {
  /// Create an interceptor.
  pub fn new(
    certs: CertificateManager,
    connector: Connector,
    handshake_timeout: Duration,
    signing_failure: TlsFailurePolicy,
  ) -> Self {
    TlsInterceptor {
      certs,
      connector,
      handshake_timeout,
      signing_failure,
    }
  }

  /// Certificate manager used for leaves.
  pub fn certificates(&self) -> &CertificateManager {
    &self.certs
  }

  /// Terminate the client's TLS and connect to `destination` over TLS.
  ///
  /// `sni` is the name the client asked for; without one the destination
  /// host names the leaf.
  pub async fn intercept(
    &self,
    client: Prebuffered<TcpStream>,
    destination: &Destination,
    sni: Option<&str>,
  ) -> Result<Interception> {
    let host = sni.unwrap_or(&destination.host).to_string();
    let mut session = TlsSession::new(host.clone());

    let leaf = match self.certs.sign_leaf(&host).await {
      Ok(leaf) => leaf,
      Err(err) => {
        return match self.signing_failure {
          TlsFailurePolicy::PassThrough => {
            tracing::info!("no leaf for {}, passing connection through", host);
            Ok(Interception::PassThrough { client, session })
          }
          TlsFailurePolicy::Terminate => {
            session.errored();
            Err(err)
          }
        };
      }
    };

    session.transition(TlsState::TerminatingClientTls)?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let client = match tokio::time::timeout(self.handshake_timeout, acceptor.accept(client)).await {
      Ok(Ok(tls)) => ClientStream::Tls(Box::new(tls)),
      Ok(Err(err)) => {
        session.errored();
        return Err(HandshakeError::from_io("client", err).into());
      }
      Err(_elapsed) => {
        session.errored();
        return Err(HandshakeError::timeout("client").into());
      }
    };

    session.transition(TlsState::ConnectingUpstreamTls)?;
    let tcp = match self.connector.connect_tcp(destination).await {
      Ok(tcp) => tcp,
      Err(err) => {
        session.errored();
        return Err(err.into());
      }
    };
    let upstream = match self.connector.upgrade_to_tls(tcp, &destination.host).await {
      Ok(upstream) => upstream,
      Err(err) => {
        session.errored();
        return Err(err.into());
      }
    };

    session.transition(TlsState::Established)?;
    Ok(Interception::Established {
      client,
      upstream,
      session,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn handshake_walks_the_expected_states() {
    let mut session = TlsSession::new("example.com");
    for state in [
      TlsState::TerminatingClientTls,
      TlsState::ConnectingUpstreamTls,
      TlsState::Established,
      TlsState::Relaying,
      TlsState::Closed,
    ] {
      session.transition(state).unwrap();
    }
    assert_eq!(session.history().len(), 6);
    assert!(session.transition(TlsState::Errored).is_err());
  }

  #[test]
  fn skipping_states_is_rejected() {
    let mut session = TlsSession::new("example.com");
    assert!(session.transition(TlsState::Established).is_err());
    session.errored();
    assert_eq!(session.state(), TlsState::Errored);
  }

  async fn interceptor(policy: TlsFailurePolicy) -> TlsInterceptor {
    use crate::ca::{CertificateAuthority, DEFAULT_LEAF_VALIDITY};
    use crate::tls::{root_store, upstream_client_config, UpstreamVerification};
    let certs = CertificateManager::new(CertificateAuthority::ephemeral().unwrap(), DEFAULT_LEAF_VALIDITY);
    let tls = upstream_client_config(UpstreamVerification::Strict, root_store(&[]).unwrap()).unwrap();
    let connector = Connector::new(tls, Duration::from_secs(1), Duration::from_secs(1));
    TlsInterceptor::new(certs, connector, Duration::from_secs(1), policy)
  }

  async fn client_stream() -> (TcpStream, Prebuffered<TcpStream>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, Prebuffered::new(server, 1024))
  }

  #[tokio::test]
  async fn unsignable_host_passes_through_untouched() {
    let (_peer, client) = client_stream().await;
    let destination = Destination::new("bad host", 443, true);
    let outcome = interceptor(TlsFailurePolicy::PassThrough)
      .await
      .intercept(client, &destination, Some("bad host"))
      .await
      .unwrap();
    match outcome {
      Interception::PassThrough { client, session } => {
        assert!(client.buffer().is_empty());
        assert_eq!(session.state(), TlsState::AwaitingClientHello);
      }
      Interception::Established { .. } => panic!("expected pass-through"),
    }
  }

  #[tokio::test]
  async fn unsignable_host_terminates_by_default() {
    let (_peer, client) = client_stream().await;
    let destination = Destination::new("bad host", 443, true);
    let outcome = interceptor(TlsFailurePolicy::Terminate)
      .await
      .intercept(client, &destination, None)
      .await;
    assert!(matches!(outcome, Err(Error::Signing(_))));
  }

  #[tokio::test]
  async fn client_handshake_timeout_is_reported() {
    let (_peer, client) = client_stream().await;
    let destination = Destination::new("example.com", 443, true);
    let outcome = interceptor(TlsFailurePolicy::Terminate)
      .await
      .intercept(client, &destination, Some("example.com"))
      .await;
    assert!(matches!(
      outcome,
      Err(Error::Handshake(HandshakeError { kind: crate::errors::HandshakeErrorKind::Timeout, .. }))
    ));
  }

  #[test]
  fn policy_names() {
    let policy: TlsFailurePolicy = serde_json::from_str("\"pass_through\"").unwrap();
    assert_eq!(policy, TlsFailurePolicy::PassThrough);
    assert_eq!(TlsFailurePolicy::default(), TlsFailurePolicy::Terminate);
  }
}
