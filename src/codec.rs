//! HTTP/1.x parsing and serialization
use crate::body::Body;
use crate::errors::{Error, ParseError};
use crate::headers::Headers;
use crate::message::{BodyFraming, HttpMessage, Message, Request, Response};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_CHUNK_LINE: usize = 4 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Size bounds applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
  /// Largest accepted start line plus header block.
  pub max_header_bytes: usize,
  /// Largest accepted decoded body.
  pub max_body_bytes: usize,
  /// Largest accepted number of header fields.
  pub max_headers: usize,
}

impl Default for ParseLimits {
  fn default() -> Self {
    ParseLimits {
      max_header_bytes: 64 * 1024,
      max_body_bytes: 32 * 1024 * 1024,
      max_headers: 128,
    }
  }
}

/// Outcome of parsing a buffer that may hold a partial message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
  /// A full message was parsed from the first `consumed` bytes.
  Complete {
    /// the parsed message
    message: T,
    /// bytes of input used
    consumed: usize,
  },
  /// The input ends before the message does.
  NeedMoreData,
}

/// What the parser needs to know about the exchange a response belongs to.
#[derive(Debug, Clone)]
pub struct ResponseContext {
  /// Method of the request being answered; `HEAD` responses carry no body.
  pub request_method: Method,
  /// Whether the connection reached end of stream after the buffered bytes.
  pub eof: bool,
}

impl ResponseContext {
  /// Context for a response to `method` with the stream still open.
  pub fn new(request_method: Method) -> Self {
    ResponseContext {
      request_method,
      eof: false,
    }
  }

  /// Mark the end of stream as seen.
  pub fn at_eof(mut self) -> Self {
    self.eof = true;
    self
  }
}

/// Request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
  /// method
  pub method: Method,
  /// request-target as sent
  pub target: String,
  /// protocol version
  pub version: Version,
  /// header fields
  pub headers: Headers,
  /// body framing derived from the headers
  pub framing: BodyFraming,
}

impl RequestHead {
  /// Attach a body.
  pub fn into_request(self, body: Body) -> Request {
    Request::from_parts(
      self.method,
      self.target,
      self.version,
      self.headers,
      body,
      self.framing,
    )
  }
}

/// Status line and header block.
#[derive(Debug, Clone)]
pub struct ResponseHead {
  /// protocol version
  pub version: Version,
  /// status code
  pub status: StatusCode,
  /// reason phrase as sent
  pub reason: String,
  /// header fields
  pub headers: Headers,
  /// body framing derived from status, headers and request method
  pub framing: BodyFraming,
}

impl ResponseHead {
  /// Attach a body.
  pub fn into_response(self, body: Body) -> Response {
    Response::from_parts(
      self.version,
      self.status,
      self.reason,
      self.headers,
      body,
      self.framing,
    )
  }
}

fn head_len(
  status: Result<httparse::Status<usize>, httparse::Error>,
  available: usize,
  limits: &ParseLimits,
) -> Result<Option<usize>, ParseError> {
  let too_large = ParseError::HeaderTooLarge {
    limit: limits.max_header_bytes,
  };
  match status {
    Ok(httparse::Status::Complete(len)) if len > limits.max_header_bytes => Err(too_large),
    Ok(httparse::Status::Complete(len)) => Ok(Some(len)),
    Ok(httparse::Status::Partial) if available > limits.max_header_bytes => Err(too_large),
    Ok(httparse::Status::Partial) => Ok(None),
    Err(httparse::Error::TooManyHeaders) => Err(too_large),
    Err(err) => Err(ParseError::malformed(err.to_string())),
  }
}

fn version_of(minor: Option<u8>) -> Version {
  match minor {
    Some(0) => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
  raw
    .iter()
    .map(|h| (h.name.to_string(), Bytes::copy_from_slice(h.value)))
    .collect()
}

/// Parse a request line and header block.
///
/// Returns the head and its length in bytes, or `None` if the block is not
/// complete yet.
pub fn parse_request_head(
  buf: &[u8],
  limits: &ParseLimits,
) -> Result<Option<(RequestHead, usize)>, ParseError> {
  let mut raw = vec![httparse::EMPTY_HEADER; limits.max_headers];
  let mut req = httparse::Request::new(&mut raw);
  let len = match head_len(req.parse(buf), buf.len(), limits)? {
    Some(len) => len,
    None => return Ok(None),
  };
  let method = req
    .method
    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
    .ok_or_else(|| ParseError::malformed("invalid method"))?;
  let target = req
    .path
    .ok_or_else(|| ParseError::malformed("missing request target"))?
    .to_string();
  let headers = collect_headers(req.headers);
  let framing = request_framing(&headers)?;
  Ok(Some((
    RequestHead {
      method,
      target,
      version: version_of(req.version),
      headers,
      framing,
    },
    len,
  )))
}

/// Parse a status line and header block for a response to `method`.
pub fn parse_response_head(
  buf: &[u8],
  method: &Method,
  limits: &ParseLimits,
) -> Result<Option<(ResponseHead, usize)>, ParseError> {
  let mut raw = vec![httparse::EMPTY_HEADER; limits.max_headers];
  let mut resp = httparse::Response::new(&mut raw);
  let len = match head_len(resp.parse(buf), buf.len(), limits)? {
    Some(len) => len,
    None => return Ok(None),
  };
  let status = resp
    .code
    .and_then(|c| StatusCode::from_u16(c).ok())
    .ok_or_else(|| ParseError::malformed("invalid status code"))?;
  let reason = resp.reason.unwrap_or_default().to_string();
  let mut headers = collect_headers(resp.headers);
  let framing = response_framing(status, method, &mut headers)?;
  Ok(Some((
    ResponseHead {
      version: version_of(resp.version),
      status,
      reason,
      headers,
      framing,
    },
    len,
  )))
}

fn declared_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
  let mut declared = None;
  for field in headers
    .iter()
    .filter(|f| f.name().eq_ignore_ascii_case("content-length"))
  {
    let value = field.value_str().ok_or(ParseError::InvalidContentLength)?;
    for part in value.split(',') {
      let part = part.trim();
      if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
      }
      let n: u64 = part.parse().map_err(|_| ParseError::InvalidContentLength)?;
      match declared {
        Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
        _ => declared = Some(n),
      }
    }
  }
  Ok(declared)
}

fn chunked_is_final(headers: &Headers) -> bool {
  headers
    .get_all("transfer-encoding")
    .flat_map(|v| v.split(','))
    .map(str::trim)
    .filter(|t| !t.is_empty())
    .last()
    .is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

fn request_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
  if headers.contains("transfer-encoding") {
    if headers.contains("content-length") {
      return Err(ParseError::malformed(
        "both content-length and transfer-encoding present",
      ));
    }
    if !chunked_is_final(headers) {
      return Err(ParseError::malformed("request transfer-encoding must end in chunked"));
    }
    return Ok(BodyFraming::Chunked);
  }
  Ok(BodyFraming::ContentLength(
    declared_length(headers)?.unwrap_or(0),
  ))
}

fn response_framing(
  status: StatusCode,
  method: &Method,
  headers: &mut Headers,
) -> Result<BodyFraming, ParseError> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyFraming::None);
  }
  if headers.contains("transfer-encoding") {
    // transfer-encoding overrides any length
    headers.remove("content-length");
    return Ok(if chunked_is_final(headers) {
      BodyFraming::Chunked
    } else {
      BodyFraming::CloseDelimited
    });
  }
  Ok(match declared_length(headers)? {
    Some(n) => BodyFraming::ContentLength(n),
    None => BodyFraming::CloseDelimited,
  })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
  Size,
  Data(u64),
  DataEnd,
  Trailer,
  Done,
}

/// Incremental decoder for the chunked transfer-coding.
///
/// Chunk extensions are ignored and trailer fields are consumed and dropped.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
  state: ChunkState,
  decoded: usize,
  max_body_bytes: usize,
}

impl ChunkedDecoder {
  /// A decoder that rejects bodies above `max_body_bytes`.
  pub fn new(max_body_bytes: usize) -> Self {
    ChunkedDecoder {
      state: ChunkState::Size,
      decoded: 0,
      max_body_bytes,
    }
  }

  /// Whether the terminating chunk and trailers have been consumed.
  pub fn is_done(&self) -> bool {
    self.state == ChunkState::Done
  }

  /// Decode as much of `input` as possible into `out`.
  ///
  /// Returns the number of input bytes consumed. Incomplete size lines and
  /// trailers are left unconsumed for the next call.
  pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, ParseError> {
    let mut pos = 0;
    loop {
      let rest = &input[pos..];
      match self.state {
        ChunkState::Done => return Ok(pos),
        ChunkState::Size => {
          let Some(line_end) = find_crlf(rest) else {
            if rest.len() > MAX_CHUNK_LINE {
              return Err(ParseError::MalformedChunk("chunk size line too long".into()));
            }
            return Ok(pos);
          };
          let size = parse_chunk_size(&rest[..line_end])?;
          pos += line_end + 2;
          if size == 0 {
            self.state = ChunkState::Trailer;
          } else {
            if self.decoded as u64 + size > self.max_body_bytes as u64 {
              return Err(ParseError::BodyTooLarge {
                limit: self.max_body_bytes,
              });
            }
            self.state = ChunkState::Data(size);
          }
        }
        ChunkState::Data(remaining) => {
          if rest.is_empty() {
            return Ok(pos);
          }
          let take = remaining.min(rest.len() as u64) as usize;
          out.put_slice(&rest[..take]);
          self.decoded += take;
          pos += take;
          let remaining = remaining - take as u64;
          self.state = if remaining == 0 {
            ChunkState::DataEnd
          } else {
            ChunkState::Data(remaining)
          };
        }
        ChunkState::DataEnd => {
          if rest.len() < 2 {
            return Ok(pos);
          }
          if &rest[..2] != CR_LF {
            return Err(ParseError::MalformedChunk(
              "missing CRLF after chunk data".into(),
            ));
          }
          pos += 2;
          self.state = ChunkState::Size;
        }
        ChunkState::Trailer => {
          let Some(line_end) = find_crlf(rest) else {
            if rest.len() > MAX_CHUNK_LINE {
              return Err(ParseError::MalformedChunk("trailer line too long".into()));
            }
            return Ok(pos);
          };
          pos += line_end + 2;
          if line_end == 0 {
            self.state = ChunkState::Done;
          }
        }
      }
    }
  }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
  buf.windows(2).position(|w| w == CR_LF)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
  let line = std::str::from_utf8(line)
    .map_err(|_| ParseError::MalformedChunk("chunk size is not ascii".into()))?;
  let size = line.split(';').next().unwrap_or_default().trim_matches([' ', '\t']);
  if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
    return Err(ParseError::MalformedChunk(format!(
      "invalid chunk size {:?}",
      size
    )));
  }
  u64::from_str_radix(size, 16)
    .map_err(|_| ParseError::MalformedChunk(format!("chunk size {:?} overflows", size)))
}

/// Parse the body that starts at the beginning of `buf`.
///
/// Returns the body and the bytes consumed, or `None` when more input is needed.
pub fn parse_body(
  buf: &[u8],
  framing: BodyFraming,
  eof: bool,
  limits: &ParseLimits,
) -> Result<Option<(Body, usize)>, ParseError> {
  let too_large = ParseError::BodyTooLarge {
    limit: limits.max_body_bytes,
  };
  match framing {
    BodyFraming::None => Ok(Some((Body::empty(), 0))),
    BodyFraming::ContentLength(n) => {
      if n > limits.max_body_bytes as u64 {
        return Err(too_large);
      }
      let n = n as usize;
      if buf.len() < n {
        return Ok(None);
      }
      Ok(Some((Bytes::copy_from_slice(&buf[..n]).into(), n)))
    }
    BodyFraming::Chunked => {
      let mut decoder = ChunkedDecoder::new(limits.max_body_bytes);
      let mut out = BytesMut::new();
      let consumed = decoder.decode(buf, &mut out)?;
      if decoder.is_done() {
        Ok(Some((out.freeze().into(), consumed)))
      } else {
        Ok(None)
      }
    }
    BodyFraming::CloseDelimited => {
      if buf.len() > limits.max_body_bytes {
        return Err(too_large);
      }
      if !eof {
        return Ok(None);
      }
      Ok(Some((Bytes::copy_from_slice(buf).into(), buf.len())))
    }
  }
}

/// Parse one complete request from the front of `buf`.
pub fn parse_request(buf: &[u8], limits: &ParseLimits) -> Result<ParseStatus<Request>, ParseError> {
  let Some((head, head_len)) = parse_request_head(buf, limits)? else {
    return Ok(ParseStatus::NeedMoreData);
  };
  match parse_body(&buf[head_len..], head.framing, false, limits)? {
    Some((body, body_len)) => Ok(ParseStatus::Complete {
      message: head.into_request(body),
      consumed: head_len + body_len,
    }),
    None => Ok(ParseStatus::NeedMoreData),
  }
}

/// Parse one complete response from the front of `buf`.
pub fn parse_response(
  buf: &[u8],
  context: &ResponseContext,
  limits: &ParseLimits,
) -> Result<ParseStatus<Response>, ParseError> {
  let Some((head, head_len)) = parse_response_head(buf, &context.request_method, limits)? else {
    return Ok(ParseStatus::NeedMoreData);
  };
  match parse_body(&buf[head_len..], head.framing, context.eof, limits)? {
    Some((body, body_len)) => Ok(ParseStatus::Complete {
      message: head.into_response(body),
      consumed: head_len + body_len,
    }),
    None => Ok(ParseStatus::NeedMoreData),
  }
}

fn put_headers(buf: &mut BytesMut, headers: &Headers) {
  for field in headers {
    buf.put_slice(field.name().as_bytes());
    buf.put_slice(COLON_SPACE);
    buf.put_slice(field.value());
    buf.put_slice(CR_LF);
  }
  buf.put_slice(CR_LF);
}

fn put_body<M: HttpMessage>(buf: &mut BytesMut, message: &M) {
  let body = message.body();
  match message.framing() {
    BodyFraming::None => {}
    BodyFraming::ContentLength(_) | BodyFraming::CloseDelimited => buf.put_slice(body),
    BodyFraming::Chunked => {
      if !body.is_empty() {
        buf.put_slice(format!("{:X}", body.len()).as_bytes());
        buf.put_slice(CR_LF);
        buf.put_slice(body);
        buf.put_slice(CR_LF);
      }
      buf.put_slice(b"0\r\n\r\n");
    }
  }
}

/// Serialize a request with headers in their original order and case.
pub fn serialize_request(request: &Request) -> Bytes {
  let mut buf = BytesMut::with_capacity(
    request.target().len() + request.headers().encoded_len() + request.body().len() + 64,
  );
  buf.put_slice(request.method().as_str().as_bytes());
  buf.put_slice(SPACE);
  buf.put_slice(request.target().as_bytes());
  buf.put_slice(SPACE);
  buf.put_slice(format!("{:?}", request.version()).as_bytes());
  buf.put_slice(CR_LF);
  put_headers(&mut buf, request.headers());
  put_body(&mut buf, request);
  buf.freeze()
}

/// Serialize a response with headers in their original order and case.
pub fn serialize_response(response: &Response) -> Bytes {
  let mut buf =
    BytesMut::with_capacity(response.headers().encoded_len() + response.body().len() + 64);
  buf.put_slice(format!("{:?}", response.version()).as_bytes());
  buf.put_slice(SPACE);
  buf.put_slice(response.status().as_str().as_bytes());
  buf.put_slice(SPACE);
  buf.put_slice(response.reason().as_bytes());
  buf.put_slice(CR_LF);
  put_headers(&mut buf, response.headers());
  put_body(&mut buf, response);
  buf.freeze()
}

/// Serialize either kind of message.
pub fn serialize(message: &Message) -> Bytes {
  match message {
    Message::Request(request) => serialize_request(request),
    Message::Response(response) => serialize_response(response),
  }
}

/// Reads messages from an async stream, keeping bytes past the end of a
/// message for the next one.
#[derive(Debug)]
pub struct MessageReader<R> {
  io: R,
  buf: BytesMut,
  limits: ParseLimits,
  received: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
  /// Wrap `io`.
  pub fn new(io: R, limits: ParseLimits) -> Self {
    Self::with_buffer(io, BytesMut::new(), limits)
  }

  /// Wrap `io`, treating `buffered` as already received input.
  pub fn with_buffer(io: R, buffered: BytesMut, limits: ParseLimits) -> Self {
    MessageReader {
      io,
      buf: buffered,
      limits,
      received: 0,
    }
  }

  /// The underlying stream.
  pub fn get_ref(&self) -> &R {
    &self.io
  }

  /// The underlying stream, for writing.
  pub fn get_mut(&mut self) -> &mut R {
    &mut self.io
  }

  /// Bytes read from the stream but not yet parsed.
  pub fn buffered(&self) -> &[u8] {
    &self.buf
  }

  /// Total bytes read from the stream.
  pub fn received(&self) -> usize {
    self.received
  }

  /// Limits in use.
  pub fn limits(&self) -> &ParseLimits {
    &self.limits
  }

  /// Give back the stream and any unparsed bytes.
  pub fn into_parts(self) -> (R, BytesMut) {
    (self.io, self.buf)
  }

  async fn fill(&mut self) -> std::io::Result<usize> {
    self.buf.reserve(READ_CHUNK);
    let n = self.io.read_buf(&mut self.buf).await?;
    self.received += n;
    Ok(n)
  }

  /// Read the next request head.
  ///
  /// Returns `Ok(None)` when the peer closes the stream between messages.
  pub async fn read_request_head(&mut self) -> crate::Result<Option<RequestHead>> {
    loop {
      if let Some((head, len)) = parse_request_head(&self.buf, &self.limits)? {
        self.buf.advance(len);
        return Ok(Some(head));
      }
      if self.fill().await? == 0 {
        return if self.buf.is_empty() {
          Ok(None)
        } else {
          Err(ParseError::Truncated.into())
        };
      }
    }
  }

  /// Read the next response head for a request with `method`.
  pub async fn read_response_head(&mut self, method: &Method) -> crate::Result<ResponseHead> {
    loop {
      if let Some((head, len)) = parse_response_head(&self.buf, method, &self.limits)? {
        self.buf.advance(len);
        return Ok(head);
      }
      if self.fill().await? == 0 {
        return Err(ParseError::Truncated.into());
      }
    }
  }

  /// Read a body framed by `framing`.
  pub async fn read_body(&mut self, framing: BodyFraming) -> crate::Result<Body> {
    let limit = self.limits.max_body_bytes;
    match framing {
      BodyFraming::None => Ok(Body::empty()),
      BodyFraming::ContentLength(n) => {
        if n > limit as u64 {
          return Err(ParseError::BodyTooLarge { limit }.into());
        }
        let n = n as usize;
        while self.buf.len() < n {
          if self.fill().await? == 0 {
            return Err(ParseError::Truncated.into());
          }
        }
        Ok(self.buf.split_to(n).freeze().into())
      }
      BodyFraming::Chunked => {
        let mut decoder = ChunkedDecoder::new(limit);
        let mut out = BytesMut::new();
        loop {
          let consumed = decoder.decode(&self.buf, &mut out)?;
          self.buf.advance(consumed);
          if decoder.is_done() {
            return Ok(out.freeze().into());
          }
          if self.fill().await? == 0 {
            return Err(ParseError::Truncated.into());
          }
        }
      }
      BodyFraming::CloseDelimited => loop {
        if self.buf.len() > limit {
          return Err(ParseError::BodyTooLarge { limit }.into());
        }
        if self.fill().await? == 0 {
          return Ok(self.buf.split().freeze().into());
        }
      },
    }
  }

  /// Resolve once the peer closes the stream or the stream fails.
  ///
  /// Bytes arriving in the meantime are kept for the next message; once a
  /// full header block's worth is buffered this stops reading and never
  /// resolves.
  pub async fn closed(&mut self) {
    while self.buf.len() < self.limits.max_header_bytes {
      match self.fill().await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
      }
    }
    std::future::pending::<()>().await
  }

  /// Read a complete request, or `None` on a clean close.
  pub async fn read_request(&mut self) -> crate::Result<Option<Request>> {
    let Some(head) = self.read_request_head().await? else {
      return Ok(None);
    };
    let body = self.read_body(head.framing).await?;
    Ok(Some(head.into_request(body)))
  }

  /// Read a complete response to a request with `method`.
  pub async fn read_response(&mut self, method: &Method) -> Result<Response, Error> {
    let head = self.read_response_head(method).await?;
    let body = self.read_body(head.framing).await?;
    Ok(head.into_response(body))
  }
}
