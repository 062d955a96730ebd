use crate::prebuffered::Prebuffered;
use std::io::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// The client side of an intercepted connection.
#[derive(Debug)]
pub enum ClientStream {
  /// Plaintext, with any inspected prefix still replayable
  Plain(Prebuffered<TcpStream>),
  /// TLS terminated by the proxy
  Tls(Box<tokio_rustls::server::TlsStream<Prebuffered<TcpStream>>>),
}

impl ClientStream {
  /// Whether the proxy terminated TLS on this connection.
  pub fn is_tls(&self) -> bool {
    matches!(self, ClientStream::Tls(_))
  }

  /// Address of the connected client.
  pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
    self.tcp().peer_addr()
  }

  fn tcp(&self) -> &TcpStream {
    match self {
      ClientStream::Plain(s) => s.get_ref(),
      ClientStream::Tls(t) => t.get_ref().0.get_ref(),
    }
  }
}

/// A connection to an upstream server.
#[derive(Debug)]
pub enum UpstreamStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl UpstreamStream {
  /// Whether the connection is TLS protected.
  pub fn is_tls(&self) -> bool {
    matches!(self, UpstreamStream::Tls(_))
  }

  /// Address of the upstream server.
  pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
    match self {
      UpstreamStream::Tcp(s) => s.peer_addr(),
      UpstreamStream::Tls(t) => t.get_ref().0.peer_addr(),
    }
  }

  /// Whether the peer has closed the connection or sent unsolicited bytes.
  ///
  /// Used before reusing an idle pooled connection. TLS streams are polled
  /// through the session so post-handshake records such as session tickets
  /// are consumed instead of counting as data.
  pub(crate) fn is_stale(&mut self) -> bool {
    let mut byte = [0u8; 1];
    let mut buf = ReadBuf::new(&mut byte);
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    match Pin::new(self).poll_read(&mut cx, &mut buf) {
      Poll::Pending => false,
      // data, EOF or an error
      Poll::Ready(_) => true,
    }
  }
}

impl AsyncRead for ClientStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
      ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for ClientStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
      ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
      ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
      ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

impl AsyncRead for UpstreamStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for UpstreamStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      UpstreamStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// Write all of `buf` and flush, bounded by `timeout` when set.
pub(crate) async fn write_all_timeout<W>(
  w: &mut W,
  buf: &[u8],
  timeout: Option<Duration>,
) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let write = async {
    w.write_all(buf).await?;
    w.flush().await
  };
  match timeout {
    None => write.await,
    Some(t) => tokio::time::timeout(t, write).await?,
  }
}
