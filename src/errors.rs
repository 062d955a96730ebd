//! engine error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `tapwire::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while intercepting a connection or a flow.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The destination of a client connection could not be determined.
  #[error("resolution error: {0}")]
  Resolution(String),
  /// The certificate authority could not sign a leaf certificate.
  #[error("signing error: {0}")]
  Signing(String),
  /// TLS handshake with the client or the upstream failed.
  #[error(transparent)]
  Handshake(#[from] HandshakeError),
  /// A message could not be parsed.
  #[error(transparent)]
  Parse(#[from] ParseError),
  /// The upstream could not be reached or misbehaved.
  #[error(transparent)]
  Dispatch(#[from] DispatchError),
  /// A hook aborted the flow.
  #[error(transparent)]
  Hook(#[from] HookError),
  /// A flow was moved through an illegal state transition.
  #[error("invalid flow transition from {from} to {to}")]
  InvalidTransition {
    /// current state
    from: &'static str,
    /// requested state
    to: &'static str,
  },
  /// Invalid or unreadable configuration.
  #[error("config error: {0}")]
  Config(String),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
}

impl Error {
  /// Create a resolution error and log it
  pub fn resolution(msg: impl Into<String>) -> Self {
    let error = Error::Resolution(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a signing error and log it
  pub fn signing(msg: impl Into<String>) -> Self {
    let error = Error::Signing(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a config error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }
}

/// Why a message could not be parsed.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  /// The header block exceeds the configured bound.
  #[error("header block exceeds {limit} bytes")]
  HeaderTooLarge {
    /// configured bound
    limit: usize,
  },
  /// The body exceeds the configured bound.
  #[error("body exceeds {limit} bytes")]
  BodyTooLarge {
    /// configured bound
    limit: usize,
  },
  /// Malformed start line or header syntax.
  #[error("malformed message: {0}")]
  Malformed(String),
  /// Malformed chunk-size line or missing chunk delimiter.
  #[error("malformed chunk: {0}")]
  MalformedChunk(String),
  /// Content-Length missing a valid value or present with conflicting values.
  #[error("invalid content-length")]
  InvalidContentLength,
  /// The peer closed the stream in the middle of a message.
  #[error("connection closed before message was complete")]
  Truncated,
}

impl ParseError {
  pub(crate) fn malformed(msg: impl Into<String>) -> Self {
    ParseError::Malformed(msg.into())
  }
}

/// Classification of a TLS handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorKind {
  /// Peer spoke something other than acceptable TLS.
  Protocol,
  /// The upstream certificate failed validation.
  CertificateValidation,
  /// The handshake did not finish in time.
  Timeout,
  /// Underlying transport failure.
  Io,
}

/// A TLS handshake failure with the side it happened on.
#[derive(ThisError, Debug)]
#[error("{side} TLS handshake failed ({kind:?}): {message}")]
pub struct HandshakeError {
  /// failure class
  pub kind: HandshakeErrorKind,
  /// `client` or `upstream`
  pub side: &'static str,
  /// human readable detail
  pub message: String,
}

impl HandshakeError {
  /// Create a handshake error and log it
  pub fn new(kind: HandshakeErrorKind, side: &'static str, message: impl Into<String>) -> Self {
    let error = HandshakeError {
      kind,
      side,
      message: message.into(),
    };
    tracing::warn!("{}", error);
    error
  }

  pub(crate) fn timeout(side: &'static str) -> Self {
    HandshakeError::new(HandshakeErrorKind::Timeout, side, "handshake timed out")
  }

  pub(crate) fn from_io(side: &'static str, err: std::io::Error) -> Self {
    // tokio-rustls reports rustls failures as InvalidData wrapping the rustls error
    let kind = match err
      .get_ref()
      .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>())
    {
      Some(tokio_rustls::rustls::Error::InvalidCertificate(_)) => {
        HandshakeErrorKind::CertificateValidation
      }
      Some(_) => HandshakeErrorKind::Protocol,
      None if err.kind() == ErrorKind::InvalidData => HandshakeErrorKind::Protocol,
      None => HandshakeErrorKind::Io,
    };
    HandshakeError::new(kind, side, err.to_string())
  }
}

/// Why a request could not be dispatched upstream.
#[derive(ThisError, Debug)]
pub enum DispatchError {
  /// Connecting took longer than the connect timeout.
  #[error("connect to {0} timed out")]
  ConnectTimeout(String),
  /// The upstream refused the connection.
  #[error("connection to {0} refused")]
  ConnectionRefused(String),
  /// The upstream host name did not resolve.
  #[error("could not resolve {0}")]
  Resolve(String),
  /// TLS towards the upstream failed.
  #[error(transparent)]
  Tls(#[from] HandshakeError),
  /// No response head arrived within the response-header timeout.
  #[error("upstream response headers timed out")]
  ResponseHeaderTimeout,
  /// The upstream closed the connection after part of the response.
  #[error("upstream reset mid-response after {received} bytes")]
  UpstreamResetMidResponse {
    /// bytes received before the reset
    received: usize,
  },
  /// The upstream sent an unparsable response.
  #[error("invalid upstream response: {0}")]
  UpstreamParse(ParseError),
  /// Other transport failure.
  #[error("upstream io error: {0}")]
  Io(std::io::Error),
}

impl DispatchError {
  /// Map a connect-time io error onto the dispatch taxonomy.
  pub(crate) fn from_connect(addr: &str, err: std::io::Error) -> Self {
    let error = match err.kind() {
      ErrorKind::ConnectionRefused => DispatchError::ConnectionRefused(addr.to_string()),
      ErrorKind::TimedOut => DispatchError::ConnectTimeout(addr.to_string()),
      _ => DispatchError::Io(err),
    };
    tracing::warn!("{}", error);
    error
  }

  /// Whether the failure happened before any byte reached the upstream.
  pub fn is_connect_failure(&self) -> bool {
    matches!(
      self,
      DispatchError::ConnectTimeout(_)
        | DispatchError::ConnectionRefused(_)
        | DispatchError::Resolve(_)
        | DispatchError::Tls(_)
    )
  }
}

/// A fault raised by a hook.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("hook `{hook}` failed: {message}")]
pub struct HookError {
  /// registered hook name
  pub hook: String,
  /// fault detail
  pub message: String,
}

impl HookError {
  /// Build a hook error; the pipeline fills in the hook name.
  pub fn msg(message: impl Into<String>) -> Self {
    HookError {
      hook: String::new(),
      message: message.into(),
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> std::io::Error {
  std::io::Error::new(error_kind, msg)
}
