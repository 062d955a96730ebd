#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tapwire
//!
//! The `tapwire` crate is an intercepting HTTP and HTTPS proxy engine.
//!
//! It terminates client connections, forges TLS leaf certificates signed by
//! an operator root, buffers complete messages, runs them through an ordered
//! chain of hooks, and relays the (possibly rewritten) traffic to the
//! original or a substituted upstream.
//!
//! - Explicit ([`CONNECT`](acceptor), absolute-form) and transparent (SNI,
//!   `Host`, original destination) clients on the same listener
//! - Leaf certificates signed on demand and cached per host
//! - Ordered request and response [hooks](hook) with fault isolation
//! - Keep-alive upstream connection pooling
//!
//! ## Rewriting requests
//!
//! ```no_run
//! use tapwire::{MitmProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let mut proxy = MitmProxy::new(ProxyConfig::default()).await?;
//!   proxy.hooks().on_request_fn("redirect", |flow, ctx| {
//!     if flow.request().pretty_host() == Some("example.com") {
//!       flow.set_host("example.org");
//!       ctx.info("redirected to example.org");
//!     }
//!     Ok(())
//!   });
//!   println!("{}", proxy.ca_cert_pem());
//!   proxy.run().await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Flows
//!
//! Every request/response exchange is a [`Flow`]. A flow moves through
//! `RequestPending → RequestIntercepted → Dispatched → ResponsePending →
//! ResponseIntercepted → Relayed`; a request hook that sets a response skips
//! straight to `ResponseIntercepted`. Any failure moves it to `Failed`.
//!
//! ## Optional Features
//!
//! - **gzip**: Decode gzip and deflate bodies in [`HttpMessage::decoded_body`].
//!

pub mod acceptor;
mod body;
pub mod ca;
pub mod codec;
pub mod config;
mod connector;
pub mod dispatch;
mod errors;
pub mod flow;
mod headers;
pub mod hook;
pub mod intercept;
mod message;
mod prebuffered;
mod proxy;
mod server;
mod socket;
pub mod tls;

pub use acceptor::{AcceptMode, Acceptor, PendingConnection};
pub use body::Body;
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use codec::{MessageReader, ParseLimits, ParseStatus};
pub use config::ProxyConfig;
pub use connector::Connector;
pub use dispatch::{ConnectionPool, Dispatcher, RetryPolicy};
pub use errors::{
  DispatchError, Error, HandshakeError, HandshakeErrorKind, HookError, ParseError, Result,
};
pub use flow::{ClientInfo, Destination, Flow, FlowError, FlowErrorKind, FlowId, FlowState, Mutation};
pub use headers::{HeaderField, Headers};
pub use hook::{
  EventLevel, EventSink, HookContext, HookEvent, HookFailurePolicy, HookPhase, HookPipeline,
  HookRegistry, MemorySink, RequestHook, ResponseHook, TracingSink,
};
pub use http::{Method, StatusCode, Version};
pub use intercept::{Interception, TlsFailurePolicy, TlsInterceptor, TlsSession, TlsState};
pub use message::{BodyFraming, HttpMessage, Message, Request, Response};
pub use prebuffered::Prebuffered;
pub use proxy::{MitmProxy, ProxyHandle};
pub use server::ProxyServer;
pub use socket::{ClientStream, UpstreamStream};
pub use tls::UpstreamVerification;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
