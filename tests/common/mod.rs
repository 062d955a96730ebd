#![allow(dead_code)]
use std::net::SocketAddr;
use tapwire::{
  CertificateAuthority, HookRegistry, MessageReader, Method, MitmProxy, ParseLimits, ProxyConfig,
  ProxyHandle, Request, Response,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub fn config() -> ProxyConfig {
  ProxyConfig::default().with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Start a proxy with an in-memory root; returns the handle and the root PEM.
pub async fn start_proxy(
  config: ProxyConfig,
  register: impl FnOnce(&mut HookRegistry),
) -> (ProxyHandle, String) {
  let ca = CertificateAuthority::ephemeral().unwrap();
  let mut proxy = MitmProxy::with_authority(config, ca).unwrap();
  register(proxy.hooks());
  let pem = proxy.ca_cert_pem().to_string();
  (proxy.start().await.unwrap(), pem)
}

/// A plain HTTP origin answering every request with `response` and
/// reporting what it received.
pub async fn spawn_origin(response: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<Request>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut reader = MessageReader::new(stream, ParseLimits::default());
        while let Ok(Some(request)) = reader.read_request().await {
          let _ = tx.send(request);
          if reader.get_mut().write_all(response).await.is_err() {
            break;
          }
        }
      });
    }
  });
  (port, rx)
}

/// Send raw bytes to the proxy and read one response.
pub async fn roundtrip(proxy: SocketAddr, raw: &[u8]) -> tapwire::Result<Response> {
  let mut stream = TcpStream::connect(proxy).await?;
  stream.write_all(raw).await?;
  let mut reader = MessageReader::new(stream, ParseLimits::default());
  reader.read_response(&Method::GET).await
}
