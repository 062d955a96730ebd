mod common;

use common::{config, start_proxy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tapwire::tls::{add_pem_bundle, upstream_client_config};
use tapwire::{
  CertificateAuthority, Destination, HttpMessage, MessageReader, Method, ParseLimits, StatusCode,
  UpstreamVerification,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TlsOrigin {
  port: u16,
  root_pem: String,
  connections: Arc<AtomicUsize>,
}

impl TlsOrigin {
  fn root_file(&self, dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join(format!("origin-{}.pem", self.port));
    std::fs::write(&path, &self.root_pem).unwrap();
    path
  }
}

/// An HTTPS origin on 127.0.0.1 with a certificate from its own root.
async fn spawn_tls_origin(body: &'static str) -> TlsOrigin {
  let origin_ca = CertificateAuthority::ephemeral().unwrap();
  let leaf = origin_ca
    .sign("127.0.0.1", std::time::Duration::from_secs(3600))
    .unwrap();
  let acceptor = TlsAcceptor::from(leaf.server_config());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let connections = Arc::new(AtomicUsize::new(0));
  let counter = connections.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      counter.fetch_add(1, Ordering::SeqCst);
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = MessageReader::new(tls, ParseLimits::default());
        while let Ok(Some(request)) = reader.read_request().await {
          let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Path: {}\r\n\r\n{}",
            body.len(),
            request.path(),
            body
          );
          if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
            break;
          }
        }
      });
    }
  });
  TlsOrigin {
    port,
    root_pem: origin_ca.ca_cert_pem().to_string(),
    connections,
  }
}

async fn connect_through(proxy: std::net::SocketAddr, port: u16, root_pem: &str) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut reply = [0u8; 39];
  stream.read_exact(&mut reply).await.unwrap();
  assert!(reply.starts_with(b"HTTP/1.1 200"));

  let mut roots = RootCertStore::empty();
  add_pem_bundle(&mut roots, root_pem.as_bytes()).unwrap();
  let client_config = upstream_client_config(UpstreamVerification::Strict, roots).unwrap();
  let connector = TlsConnector::from(Arc::clone(&client_config));
  let name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
  connector.connect(name, stream).await.unwrap()
}

#[tokio::test]
async fn https_is_intercepted_with_a_forged_leaf() {
  let origin = spawn_tls_origin("secret").await;
  let port = origin.port;
  let dir = tempfile::tempdir().unwrap();
  let root_path = origin.root_file(dir.path());

  let (proxy, proxy_root) = start_proxy(config().with_extra_root_pem(&root_path), |hooks| {
    hooks.on_response_fn("tag", |flow, _ctx| {
      if let Some(response) = flow.response_mut() {
        response.headers_mut().set("X-Intercepted", "yes");
      }
      Ok(())
    });
  })
  .await;

  let tls = connect_through(proxy.local_addr(), port, &proxy_root).await;
  let mut reader = MessageReader::new(tls, ParseLimits::default());
  for path in ["/a", "/b"] {
    let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
    reader.get_mut().write_all(request.as_bytes()).await.unwrap();
    let response = reader.read_response(&Method::GET).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&response.body()[..], b"secret");
    assert_eq!(response.headers().get("x-path"), Some(path));
    assert_eq!(response.headers().get("x-intercepted"), Some("yes"));
  }
  // the upstream opened during the handshake carried both flows
  assert_eq!(origin.connections.load(Ordering::SeqCst), 1);
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_upstream_serves_the_first_flow() {
  let origin = spawn_tls_origin("first").await;
  let dir = tempfile::tempdir().unwrap();
  let (proxy, proxy_root) =
    start_proxy(config().with_extra_root_pem(origin.root_file(dir.path())), |_| {}).await;

  let tls = connect_through(proxy.local_addr(), origin.port, &proxy_root).await;
  // give the origin time to send its session tickets
  tokio::time::sleep(std::time::Duration::from_millis(200)).await;
  let mut reader = MessageReader::new(tls, ParseLimits::default());
  let request = format!("GET /once HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin.port);
  reader.get_mut().write_all(request.as_bytes()).await.unwrap();
  let response = reader.read_response(&Method::GET).await.unwrap();
  assert_eq!(&response.body()[..], b"first");
  assert_eq!(origin.connections.load(Ordering::SeqCst), 1);
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn intercepted_https_can_be_redirected() {
  let spoofed = spawn_tls_origin("spoofed").await;
  let article = spawn_tls_origin("article").await;
  let dir = tempfile::tempdir().unwrap();
  let article_port = article.port;
  let config = config()
    .with_extra_root_pem(spoofed.root_file(dir.path()))
    .with_extra_root_pem(article.root_file(dir.path()));
  let (proxy, proxy_root) = start_proxy(config, move |hooks| {
    hooks.on_request_fn("redirect", move |flow, ctx| {
      let host = flow.request().pretty_host().map(str::to_ascii_lowercase);
      if host.is_some_and(|h| h.ends_with("example.com") || h.ends_with("example.org")) {
        flow.set_destination(Destination::new("127.0.0.1", article_port, true));
        flow.request_mut().set_path("/wiki/Man-in-the-middle_attack");
        ctx.info("redirected");
      }
      Ok(())
    });
  })
  .await;

  let tls = connect_through(proxy.local_addr(), spoofed.port, &proxy_root).await;
  let mut reader = MessageReader::new(tls, ParseLimits::default());
  reader
    .get_mut()
    .write_all(b"GET /home HTTP/1.1\r\nHost: www.example.com\r\n\r\n")
    .await
    .unwrap();
  let response = reader.read_response(&Method::GET).await.unwrap();
  assert_eq!(&response.body()[..], b"article");
  assert_eq!(response.headers().get("x-path"), Some("/wiki/Man-in-the-middle_attack"));

  // hosts that do not match stay on the original upstream
  reader
    .get_mut()
    .write_all(b"GET /home HTTP/1.1\r\nHost: www.example.net\r\n\r\n")
    .await
    .unwrap();
  let response = reader.read_response(&Method::GET).await.unwrap();
  assert_eq!(&response.body()[..], b"spoofed");
  assert_eq!(response.headers().get("x-path"), Some("/home"));
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn untrusted_upstream_is_refused_in_strict_mode() {
  let origin = spawn_tls_origin("secret").await;
  let port = origin.port;
  let (proxy, _) = start_proxy(config(), |_| {}).await;

  let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
  stream
    .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut reply = [0u8; 39];
  stream.read_exact(&mut reply).await.unwrap();

  // the client handshake completes first; the upstream failure then closes the connection
  let client_config =
    upstream_client_config(UpstreamVerification::Disabled, RootCertStore::empty()).unwrap();
  let connector = TlsConnector::from(client_config);
  let name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
  if let Ok(mut tls) = connector.connect(name, stream).await {
    let _ = tls.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let mut rest = Vec::new();
    let read = tls.read_to_end(&mut rest).await;
    assert!(read.is_err() || rest.is_empty());
  }
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn interception_can_be_switched_off() {
  let origin = spawn_tls_origin("direct").await;
  let (proxy, _) = start_proxy(config().with_intercept_tls(false), |_| {}).await;

  // the client sees the origin's own certificate through the raw tunnel
  let tls = connect_through(proxy.local_addr(), origin.port, &origin.root_pem).await;
  let mut reader = MessageReader::new(tls, ParseLimits::default());
  reader
    .get_mut()
    .write_all(b"GET /raw HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();
  let response = reader.read_response(&Method::GET).await.unwrap();
  assert_eq!(&response.body()[..], b"direct");
  proxy.stop().await.unwrap();
}
