//! Request and response messages
use crate::body::Body;
use crate::errors::ParseError;
use crate::headers::Headers;
use bytes::Bytes;
use http::{Method, StatusCode, Version};
#[cfg(feature = "gzip")]
use std::io::Read;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// `Content-Length` delimited; requests without a length use `ContentLength(0)`.
  ContentLength(u64),
  /// `Transfer-Encoding: chunked`.
  Chunked,
  /// Delimited by the server closing the connection (responses only).
  CloseDelimited,
  /// The message cannot carry a body (responses to HEAD, 1xx, 204 and 304).
  None,
}

/// Accessors shared by requests and responses.
pub trait HttpMessage {
  /// Header fields in wire order.
  fn headers(&self) -> &Headers;
  /// Mutable header fields.
  fn headers_mut(&mut self) -> &mut Headers;
  /// The buffered body.
  fn body(&self) -> &Body;
  /// Replace the body. Framing headers are re-synchronized before relay.
  fn set_body(&mut self, body: Body);
  /// Declared body framing.
  fn framing(&self) -> BodyFraming;
  /// Mutable framing.
  fn framing_mut(&mut self) -> &mut BodyFraming;
  /// Whether this is a response (close-delimited framing is legal).
  fn is_response(&self) -> bool;

  /// Parsed `Content-Type`, if present and well-formed.
  fn content_type(&self) -> Option<mime::Mime> {
    self
      .headers()
      .get("content-type")
      .and_then(|v| v.parse::<mime::Mime>().ok())
  }

  /// Declared `Content-Length`, if present and numeric.
  fn content_length(&self) -> Option<u64> {
    self
      .headers()
      .get("content-length")
      .and_then(|v| v.trim().parse().ok())
  }

  /// The body with any `Content-Encoding` removed.
  fn decoded_body(&self) -> std::io::Result<Bytes> {
    let encoding = self
      .headers()
      .get("content-encoding")
      .map(|v| v.trim().to_ascii_lowercase());
    match encoding.as_deref() {
      None | Some("") | Some("identity") => Ok(self.body().clone().into_bytes()),
      #[cfg(feature = "gzip")]
      Some("gzip") | Some("x-gzip") => {
        let mut out = Vec::new();
        flate2::read::MultiGzDecoder::new(&self.body()[..]).read_to_end(&mut out)?;
        Ok(out.into())
      }
      #[cfg(feature = "gzip")]
      Some("deflate") => {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(&self.body()[..]).read_to_end(&mut out)?;
        Ok(out.into())
      }
      Some(other) => Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("unsupported content-encoding: {}", other),
      )),
    }
  }

  /// Replace the body with unencoded bytes and drop `Content-Encoding`.
  fn set_decoded_body(&mut self, body: Body) {
    self.headers_mut().remove("content-encoding");
    self.set_body(body);
  }

  /// Re-synchronize framing headers with the current body.
  ///
  /// Content-Length framing gets the real length, close-delimited bodies
  /// become Content-Length framed, chunked bodies lose any Content-Length.
  /// A body still carrying other transfer-codings (`gzip`, ...) is re-framed
  /// as `<codings>, chunked` so the codings survive the relay.
  fn prepare_for_relay(&mut self) {
    let len = self.body().len() as u64;
    let codings: Vec<String> = self
      .headers()
      .get_all("transfer-encoding")
      .flat_map(|v| v.split(','))
      .map(str::trim)
      .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("chunked"))
      .map(str::to_string)
      .collect();
    if !codings.is_empty() && self.framing() != BodyFraming::None {
      self.headers_mut().remove("content-length");
      self
        .headers_mut()
        .set("Transfer-Encoding", format!("{}, chunked", codings.join(", ")));
      *self.framing_mut() = BodyFraming::Chunked;
      return;
    }
    match self.framing() {
      BodyFraming::Chunked => {
        self.headers_mut().remove("content-length");
        if !self.headers().has_token("transfer-encoding", "chunked") {
          self.headers_mut().set("Transfer-Encoding", "chunked");
        }
      }
      BodyFraming::ContentLength(_) | BodyFraming::CloseDelimited => {
        *self.framing_mut() = BodyFraming::ContentLength(len);
        self.headers_mut().remove("transfer-encoding");
        if len > 0 || self.headers().contains("content-length") || self.is_response() {
          self.headers_mut().set("Content-Length", len.to_string());
        }
      }
      BodyFraming::None => {}
    }
  }

  /// Check that the body agrees with the declared framing.
  fn validate(&self) -> Result<(), ParseError> {
    let len = self.body().len() as u64;
    match self.framing() {
      BodyFraming::ContentLength(n) => {
        if n != len {
          return Err(ParseError::InvalidContentLength);
        }
        if self.headers().contains("transfer-encoding") {
          return Err(ParseError::malformed("content-length framing with transfer-encoding"));
        }
        match self.headers().get("content-length") {
          Some(v) if v.trim().parse::<u64>().ok() != Some(n) => {
            Err(ParseError::InvalidContentLength)
          }
          _ => Ok(()),
        }
      }
      BodyFraming::Chunked => {
        if !self.headers().has_token("transfer-encoding", "chunked")
          || self.headers().contains("content-length")
        {
          return Err(ParseError::malformed("chunked framing without chunked coding"));
        }
        Ok(())
      }
      BodyFraming::CloseDelimited if !self.is_response() => Err(ParseError::malformed(
        "close-delimited body on a request",
      )),
      BodyFraming::CloseDelimited => Ok(()),
      BodyFraming::None if len > 0 => Err(ParseError::malformed("body on a bodiless response")),
      BodyFraming::None => Ok(()),
    }
  }
}

/// An HTTP/1.x request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  method: Method,
  target: String,
  version: Version,
  headers: Headers,
  body: Body,
  framing: BodyFraming,
}

impl Request {
  /// Create a bodiless HTTP/1.1 request for `target`.
  pub fn new(method: Method, target: impl Into<String>) -> Self {
    Request {
      method,
      target: target.into(),
      version: Version::HTTP_11,
      headers: Headers::new(),
      body: Body::empty(),
      framing: BodyFraming::ContentLength(0),
    }
  }

  pub(crate) fn from_parts(
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    body: Body,
    framing: BodyFraming,
  ) -> Self {
    Request {
      method,
      target,
      version,
      headers,
      body,
      framing,
    }
  }

  /// Append a header, builder style.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
    self.headers.append(name, value);
    self
  }

  /// Set a Content-Length framed body, builder style.
  pub fn with_body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self.framing = BodyFraming::ContentLength(self.body.len() as u64);
    self
      .headers
      .set("Content-Length", self.body.len().to_string());
    self
  }

  /// The request method.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Replace the method.
  pub fn set_method(&mut self, method: Method) {
    self.method = method;
  }
  /// The request-target exactly as received.
  pub fn target(&self) -> &str {
    &self.target
  }
  /// Replace the request-target.
  pub fn set_target(&mut self, target: impl Into<String>) {
    self.target = target.into();
  }
  /// Protocol version.
  pub fn version(&self) -> Version {
    self.version
  }

  /// Path and query of the target, for origin-form and absolute-form targets.
  pub fn path(&self) -> &str {
    match split_absolute(&self.target) {
      Some((_, _, path)) => path,
      None => &self.target,
    }
  }

  /// Replace the path and query, keeping scheme and authority of absolute-form targets.
  pub fn set_path(&mut self, path: &str) {
    let path = if path.starts_with('/') || path == "*" {
      path.to_string()
    } else {
      format!("/{}", path)
    };
    self.target = match split_absolute(&self.target) {
      Some((scheme, authority, _)) => format!("{}://{}{}", scheme, authority, path),
      None => path,
    };
  }

  /// Host the client asked for, without port.
  ///
  /// Taken from an absolute-form target, else from the `Host` header.
  pub fn pretty_host(&self) -> Option<&str> {
    let authority = match split_absolute(&self.target) {
      Some((_, authority, _)) => Some(authority),
      None => self.headers.get("host"),
    }?;
    let (host, _) = split_authority(authority.trim());
    if host.is_empty() {
      None
    } else {
      Some(host)
    }
  }

  /// Whether the target is in absolute form (`http://host/...`).
  pub fn is_absolute_form(&self) -> bool {
    split_absolute(&self.target).is_some()
  }

  /// Whether the client wants the connection kept open after this exchange.
  pub fn wants_keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
}

impl HttpMessage for Request {
  fn headers(&self) -> &Headers {
    &self.headers
  }
  fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }
  fn body(&self) -> &Body {
    &self.body
  }
  fn set_body(&mut self, body: Body) {
    self.body = body;
  }
  fn framing(&self) -> BodyFraming {
    self.framing
  }
  fn framing_mut(&mut self) -> &mut BodyFraming {
    &mut self.framing
  }
  fn is_response(&self) -> bool {
    false
  }
}

/// An HTTP/1.x response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  version: Version,
  status: StatusCode,
  reason: String,
  headers: Headers,
  body: Body,
  framing: BodyFraming,
}

impl Response {
  /// Create an empty HTTP/1.1 response with the canonical reason phrase.
  pub fn new(status: StatusCode) -> Self {
    Response {
      version: Version::HTTP_11,
      status,
      reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
      headers: Headers::new(),
      body: Body::empty(),
      framing: if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
      {
        BodyFraming::None
      } else {
        BodyFraming::ContentLength(0)
      },
    }
  }

  pub(crate) fn from_parts(
    version: Version,
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Body,
    framing: BodyFraming,
  ) -> Self {
    Response {
      version,
      status,
      reason,
      headers,
      body,
      framing,
    }
  }

  /// A complete response with a Content-Length framed body.
  pub fn synthetic(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Self {
    Response::new(status)
      .with_header("Content-Type", content_type.to_string())
      .with_body(body)
  }

  /// Append a header, builder style.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
    self.headers.append(name, value);
    self
  }

  /// Set a Content-Length framed body, builder style.
  pub fn with_body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self.framing = BodyFraming::ContentLength(self.body.len() as u64);
    self
      .headers
      .set("Content-Length", self.body.len().to_string());
    self
  }

  /// Status code.
  pub fn status(&self) -> StatusCode {
    self.status
  }
  /// Replace the status; the reason phrase follows the canonical one.
  pub fn set_status(&mut self, status: StatusCode) {
    self.status = status;
    self.reason = status.canonical_reason().unwrap_or("Unknown").to_string();
  }
  /// Reason phrase as received.
  pub fn reason(&self) -> &str {
    &self.reason
  }
  /// Protocol version.
  pub fn version(&self) -> Version {
    self.version
  }

  /// Whether the server allows the connection to be reused.
  pub fn allows_keep_alive(&self) -> bool {
    self.framing != BodyFraming::CloseDelimited && keep_alive(self.version, &self.headers)
  }
}

impl HttpMessage for Response {
  fn headers(&self) -> &Headers {
    &self.headers
  }
  fn headers_mut(&mut self) -> &mut Headers {
    &mut self.headers
  }
  fn body(&self) -> &Body {
    &self.body
  }
  fn set_body(&mut self, body: Body) {
    self.body = body;
  }
  fn framing(&self) -> BodyFraming {
    self.framing
  }
  fn framing_mut(&mut self) -> &mut BodyFraming {
    &mut self.framing
  }
  fn is_response(&self) -> bool {
    true
  }
}

/// Either side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
  /// a request
  Request(Request),
  /// a response
  Response(Response),
}

impl From<Request> for Message {
  fn from(value: Request) -> Self {
    Message::Request(value)
  }
}

impl From<Response> for Message {
  fn from(value: Response) -> Self {
    Message::Response(value)
  }
}

fn keep_alive(version: Version, headers: &Headers) -> bool {
  if headers.has_token("connection", "close") {
    return false;
  }
  version >= Version::HTTP_11 || headers.has_token("connection", "keep-alive")
}

/// Split `scheme://authority/path` into its parts.
pub(crate) fn split_absolute(target: &str) -> Option<(&str, &str, &str)> {
  let (scheme, rest) = target.split_once("://")?;
  if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
    return None;
  }
  match rest.find(['/', '?']) {
    Some(idx) => Some((scheme, &rest[..idx], &rest[idx..])),
    None => Some((scheme, rest, "/")),
  }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub(crate) fn split_authority(authority: &str) -> (&str, Option<u16>) {
  let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
      return (host, port);
    }
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(port) => (host, Some(port)),
      Err(_) => (authority, None),
    },
    _ => (authority, None),
  }
}
