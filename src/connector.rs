use crate::errors::{new_io_error, DispatchError, HandshakeError};
use crate::flow::Destination;
use crate::socket::UpstreamStream;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Opens TCP and TLS connections to upstream servers.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  handshake_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("handshake_timeout", &self.handshake_timeout)
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// Create a connector using `tls` for upstream TLS.
  pub fn new(tls: Arc<ClientConfig>, connect_timeout: Duration, handshake_timeout: Duration) -> Self {
    Connector {
      connect_timeout,
      handshake_timeout,
      nodelay: true,
      keepalive: true,
      tls: TlsConnector::from(tls),
    }
  }

  /// Resolve `destination` and connect to the first address that accepts.
  pub async fn connect_tcp(&self, destination: &Destination) -> Result<TcpStream, DispatchError> {
    let target = destination.addr();
    let resolved = tokio::net::lookup_host(target.clone()).await;
    let addrs: Vec<SocketAddr> = match resolved {
      Ok(addrs) => addrs.collect(),
      Err(err) => {
        tracing::warn!("could not resolve {}: {}", target, err);
        return Err(DispatchError::Resolve(target));
      }
    };
    if addrs.is_empty() {
      return Err(DispatchError::Resolve(target));
    }
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(err) => last_error = Some(err),
      }
    }
    let err = last_error.unwrap_or_else(|| new_io_error(std::io::ErrorKind::NotFound, "no address"));
    Err(DispatchError::from_connect(&target, err))
  }

  /// Connect to a resolved address within the connect timeout.
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    if self.keepalive {
      socket.set_keepalive(true)?;
    }
    tokio::time::timeout(self.connect_timeout, socket.connect(addr))
      .await
      .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))?
  }

  /// Run a client TLS handshake over `stream` for `host`.
  pub async fn upgrade_to_tls(
    &self,
    stream: TcpStream,
    host: &str,
  ) -> Result<UpstreamStream, HandshakeError> {
    let name = ServerName::try_from(host.to_owned()).map_err(|e| {
      HandshakeError::new(
        crate::errors::HandshakeErrorKind::Protocol,
        "upstream",
        format!("invalid server name {}: {}", host, e),
      )
    })?;
    match tokio::time::timeout(self.handshake_timeout, self.tls.connect(name, stream)).await {
      Ok(Ok(tls)) => Ok(UpstreamStream::Tls(Box::new(tls))),
      Ok(Err(err)) => Err(HandshakeError::from_io("upstream", err)),
      Err(_elapsed) => Err(HandshakeError::timeout("upstream")),
    }
  }

  /// Connect to `destination`, with TLS when it asks for it.
  pub async fn connect(&self, destination: &Destination) -> Result<UpstreamStream, DispatchError> {
    let tcp = self.connect_tcp(destination).await?;
    if destination.tls {
      Ok(self.upgrade_to_tls(tcp, &destination.host).await?)
    } else {
      Ok(UpstreamStream::Tcp(tcp))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tls::{root_store, upstream_client_config, UpstreamVerification};

  fn connector() -> Connector {
    let tls = upstream_client_config(UpstreamVerification::Strict, root_store(&[]).unwrap()).unwrap();
    Connector::new(tls, Duration::from_secs(2), Duration::from_secs(2))
  }

  #[tokio::test]
  async fn refused_connection_is_classified() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let err = connector()
      .connect(&Destination::new("127.0.0.1", port, false))
      .await
      .unwrap_err();
    assert!(matches!(err, DispatchError::ConnectionRefused(_)));
  }

  #[tokio::test]
  async fn unresolvable_host_is_classified() {
    let err = connector()
      .connect(&Destination::new("does-not-exist.invalid", 80, false))
      .await
      .unwrap_err();
    assert!(matches!(err, DispatchError::Resolve(_)));
  }

  #[tokio::test]
  async fn plain_connection_succeeds() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stream = connector()
      .connect(&Destination::new("127.0.0.1", port, false))
      .await
      .unwrap();
    assert!(!stream.is_tls());
  }
}
