//! Connection acceptor
//!
//! Looks at the first bytes of a client connection, without losing them,
//! and works out where the client wants to go.
use crate::codec::{parse_request_head, serialize_response, ParseLimits};
use crate::errors::{Error, ParseError, Result};
use crate::flow::Destination;
use crate::message::{split_absolute, split_authority};
use crate::prebuffered::Prebuffered;
use crate::server::{error_page, error_status};
use crate::socket::write_all_timeout;
use http::Method;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// How the client addressed the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
  /// `CONNECT host:port` tunnel
  Connect,
  /// Plain HTTP with absolute-form targets
  Forward,
  /// The client believes it talks to the origin (SNI, `Host` or original destination)
  Transparent,
}

impl fmt::Display for AcceptMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      AcceptMode::Connect => "connect",
      AcceptMode::Forward => "forward",
      AcceptMode::Transparent => "transparent",
    })
  }
}

/// A client connection whose destination is known.
#[derive(Debug)]
pub struct PendingConnection {
  /// client stream; inspected bytes are replayed to the next reader
  pub client: Prebuffered<TcpStream>,
  /// client address
  pub peer_addr: SocketAddr,
  /// destination host
  pub host: String,
  /// destination port
  pub port: u16,
  /// whether the client speaks TLS on this stream
  pub is_tls: bool,
  /// whether the upstream expects TLS
  pub upstream_tls: bool,
  /// how the destination was learned
  pub mode: AcceptMode,
  /// server name from the ClientHello
  pub sni: Option<String>,
}

impl PendingConnection {
  /// Where requests on this connection go by default.
  pub fn destination(&self) -> Destination {
    Destination::new(self.host.clone(), self.port, self.upstream_tls)
  }
}

/// Resolves the destination of freshly accepted connections.
#[derive(Debug, Clone)]
pub struct Acceptor {
  max_header_bytes: usize,
  handshake_timeout: Duration,
  transparent: bool,
  error_pages: bool,
}

impl Acceptor {
  /// Create an acceptor buffering at most `max_header_bytes` while it
  /// looks for a destination, giving up after `handshake_timeout`.
  pub fn new(max_header_bytes: usize, handshake_timeout: Duration, transparent: bool) -> Self {
    Acceptor {
      max_header_bytes,
      handshake_timeout,
      transparent,
      error_pages: false,
    }
  }

  /// Answer an unparsable first request with a synthetic `400`/`431`
  /// before closing.
  pub fn with_error_pages(mut self, enabled: bool) -> Self {
    self.error_pages = enabled;
    self
  }

  /// Inspect `stream` and resolve its destination.
  pub async fn accept(&self, stream: TcpStream) -> Result<PendingConnection> {
    let peer_addr = stream.peer_addr()?;
    let original_dst = if self.transparent {
      original_destination(&stream)
    } else {
      None
    };
    let mut client = Prebuffered::new(stream, self.max_header_bytes);
    let resolved = match tokio::time::timeout(
      self.handshake_timeout,
      self.resolve(&mut client, original_dst),
    )
    .await
    {
      Ok(Ok(resolved)) => resolved,
      Ok(Err(err)) => {
        if self.error_pages && matches!(err, Error::Parse(_)) {
          let page = error_page(error_status(&err, true), &err);
          let _ = write_all_timeout(
            &mut client,
            &serialize_response(&page),
            Some(self.handshake_timeout),
          )
          .await;
        }
        return Err(err);
      }
      Err(_elapsed) => {
        return Err(Error::resolution(format!(
          "{} sent nothing usable in time",
          peer_addr
        )));
      }
    };
    tracing::debug!(
      "{} -> {}:{} ({}, tls: {})",
      peer_addr,
      resolved.host,
      resolved.port,
      resolved.mode,
      resolved.is_tls
    );
    Ok(PendingConnection {
      client,
      peer_addr,
      host: resolved.host,
      port: resolved.port,
      is_tls: resolved.is_tls,
      upstream_tls: resolved.upstream_tls,
      mode: resolved.mode,
      sni: resolved.sni,
    })
  }

  async fn resolve(
    &self,
    client: &mut Prebuffered<TcpStream>,
    original_dst: Option<SocketAddr>,
  ) -> Result<Resolved> {
    if !client.fill_to(1).await? {
      return Err(Error::resolution("client closed before sending data"));
    }
    if client.buffer()[0] == TLS_HANDSHAKE_RECORD {
      let sni = read_sni(client).await?;
      let (host, port) = match (&sni, original_dst) {
        (Some(name), dst) => (name.clone(), dst.map_or(443, |d| d.port())),
        (None, Some(dst)) => (dst.ip().to_string(), dst.port()),
        (None, None) => {
          return Err(Error::resolution("ClientHello without server name"));
        }
      };
      return Ok(Resolved {
        host,
        port,
        is_tls: true,
        upstream_tls: true,
        mode: AcceptMode::Transparent,
        sni,
      });
    }
    self.resolve_http(client, original_dst).await
  }

  async fn resolve_http(
    &self,
    client: &mut Prebuffered<TcpStream>,
    original_dst: Option<SocketAddr>,
  ) -> Result<Resolved> {
    let limits = ParseLimits {
      max_header_bytes: self.max_header_bytes,
      ..ParseLimits::default()
    };
    let (head, len) = loop {
      match parse_request_head(client.buffer(), &limits) {
        Ok(Some(parsed)) => break parsed,
        Ok(None) => {}
        Err(err) => return Err(err.into()),
      }
      if client.buffer_more().await? == 0 {
        if client.is_full() {
          return Err(
            ParseError::HeaderTooLarge {
              limit: self.max_header_bytes,
            }
            .into(),
          );
        }
        return Err(Error::resolution(
          "client closed before the request head was complete",
        ));
      }
    };

    if head.method == Method::CONNECT {
      let (host, port) = split_authority(&head.target);
      if host.is_empty() {
        return Err(Error::resolution(format!("bad CONNECT target {}", head.target)));
      }
      let host = host.to_string();
      let port = port.unwrap_or(443);
      client.consume(len);
      client.write_all(CONNECT_ESTABLISHED).await?;
      client.flush().await?;
      if !client.fill_to(1).await? {
        return Err(Error::resolution("client closed the tunnel before sending data"));
      }
      let is_tls = client.buffer()[0] == TLS_HANDSHAKE_RECORD;
      let sni = if is_tls { read_sni(client).await? } else { None };
      return Ok(Resolved {
        host,
        port,
        is_tls,
        upstream_tls: is_tls,
        mode: AcceptMode::Connect,
        sni,
      });
    }

    if let Some((scheme, authority, _)) = split_absolute(&head.target) {
      let upstream_tls = scheme.eq_ignore_ascii_case("https");
      let (host, port) = split_authority(authority);
      if host.is_empty() {
        return Err(Error::resolution(format!("no host in {}", head.target)));
      }
      return Ok(Resolved {
        host: host.to_string(),
        port: port.unwrap_or(if upstream_tls { 443 } else { 80 }),
        is_tls: false,
        upstream_tls,
        mode: AcceptMode::Forward,
        sni: None,
      });
    }

    let (host, port) = match head.headers.get("host").map(|h| split_authority(h.trim())) {
      Some((host, port)) if !host.is_empty() => (
        host.to_string(),
        port.or(original_dst.map(|d| d.port())).unwrap_or(80),
      ),
      _ => match original_dst {
        Some(dst) => (dst.ip().to_string(), dst.port()),
        None => return Err(Error::resolution("request without Host header")),
      },
    };
    Ok(Resolved {
      host,
      port,
      is_tls: false,
      upstream_tls: false,
      mode: AcceptMode::Transparent,
      sni: None,
    })
  }
}

struct Resolved {
  host: String,
  port: u16,
  is_tls: bool,
  upstream_tls: bool,
  mode: AcceptMode,
  sni: Option<String>,
}

/// Buffer the first TLS record and pull the server name out of it.
///
/// A record larger than the look-ahead bound yields `None`.
async fn read_sni(client: &mut Prebuffered<TcpStream>) -> Result<Option<String>> {
  if !client.fill_to(5).await? {
    return Err(Error::resolution("client closed during ClientHello"));
  }
  let record_len = u16::from_be_bytes([client.buffer()[3], client.buffer()[4]]) as usize;
  if !client.fill_to(5 + record_len).await? {
    if client.is_full() {
      return Ok(None);
    }
    return Err(Error::resolution("client closed during ClientHello"));
  }
  Ok(parse_sni(client.buffer()))
}

fn be16(buf: &[u8], pos: usize) -> Option<usize> {
  Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]) as usize)
}

/// Extract the `server_name` from a TLS record holding a ClientHello.
pub fn parse_sni(buf: &[u8]) -> Option<String> {
  if buf.len() < 5 || buf[0] != TLS_HANDSHAKE_RECORD {
    return None;
  }
  let record_len = be16(buf, 3)?;
  let record = buf.get(5..5 + record_len)?;
  if *record.first()? != CLIENT_HELLO {
    return None;
  }
  // handshake header (4), client version (2), random (32)
  let mut pos = 4 + 2 + 32;
  pos += 1 + *record.get(pos)? as usize;
  pos += 2 + be16(record, pos)?;
  pos += 1 + *record.get(pos)? as usize;
  let extensions_end = (pos + 2 + be16(record, pos)?).min(record.len());
  pos += 2;
  while pos + 4 <= extensions_end {
    let kind = be16(record, pos)? as u16;
    let len = be16(record, pos + 2)?;
    pos += 4;
    if kind == SERVER_NAME_EXTENSION {
      // list length (2), name type (1), name length (2), name
      let name_type = *record.get(pos + 2)?;
      let name_len = be16(record, pos + 3)?;
      let name = record.get(pos + 5..pos + 5 + name_len)?;
      if name_type != 0 {
        return None;
      }
      return std::str::from_utf8(name).ok().map(|s| s.to_ascii_lowercase());
    }
    pos += len;
  }
  None
}

#[cfg(target_os = "linux")]
fn original_destination(stream: &TcpStream) -> Option<SocketAddr> {
  let addr = socket2::SockRef::from(stream)
    .original_dst()
    .ok()?
    .as_socket()?;
  // without a redirect rule the original destination is the listener itself
  if stream.local_addr().ok() == Some(addr) {
    return None;
  }
  Some(addr)
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_stream: &TcpStream) -> Option<SocketAddr> {
  None
}
