mod common;

use common::{config, roundtrip, spawn_origin, start_proxy};
use std::time::Duration;
use std::io::Cursor;
use tapwire::{
  Body, Destination, Flow, HookContext, HookError, HttpMessage, Response, ResponseHook, StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";

#[tokio::test]
async fn plain_request_is_relayed() {
  let (port, mut seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), |_| {}).await;
  let raw = format!(
    "GET http://127.0.0.1:{port}/index.html HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
  );
  let response = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(&response.body()[..], b"hello");

  let upstream = seen.recv().await.unwrap();
  assert_eq!(upstream.target(), "/index.html");
  assert!(!upstream.headers().contains("proxy-connection"));
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn redirect_hook_sends_request_elsewhere() {
  let (port, mut seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), move |hooks| {
    hooks.on_request_fn("redirect", move |flow, ctx| {
      let host = flow.request().pretty_host().map(str::to_string);
      if host.is_some_and(|h| h.ends_with("example.com") || h.ends_with("example.org")) {
        flow.set_destination(Destination::new("127.0.0.1", port, false));
        flow.request_mut().set_path("/wiki/Man-in-the-middle_attack");
        flow.record_mutation("redirected");
        ctx.info("redirected");
      }
      Ok(())
    });
  })
  .await;

  let raw = b"GET http://www.example.com/anything HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
  let response = roundtrip(proxy.local_addr(), raw).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);

  let upstream = seen.recv().await.unwrap();
  assert_eq!(upstream.target(), "/wiki/Man-in-the-middle_attack");
  assert_eq!(upstream.headers().get("host"), Some(format!("127.0.0.1:{port}").as_str()));
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn replaced_body_gets_matching_length() {
  let (port, _seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), |hooks| {
    hooks.on_response_fn("replace", |flow, _ctx| {
      if let Some(response) = flow.response_mut() {
        response.set_body(Body::from("a considerably longer body"));
      }
      Ok(())
    });
  })
  .await;

  let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  let response = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(&response.body()[..], b"a considerably longer body");
  assert_eq!(response.content_length(), Some(26));
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn request_hook_can_answer_directly() {
  let (proxy, _) = start_proxy(config(), |hooks| {
    hooks.on_request_fn("block", |flow, _ctx| {
      flow.set_response(Response::synthetic(StatusCode::FORBIDDEN, "text/plain", "blocked"));
      Ok(())
    });
  })
  .await;
  // nothing listens on port 9; the request must never be dispatched
  let raw = b"GET http://127.0.0.1:9/ HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n";
  let response = roundtrip(proxy.local_addr(), raw).await.unwrap();
  assert_eq!(response.status(), StatusCode::FORBIDDEN);
  assert_eq!(&response.body()[..], b"blocked");
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn faulty_hook_does_not_break_the_flow() {
  let (port, _seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), |hooks| {
    hooks.on_request_fn("fails", |_flow, _ctx| Err(HookError::msg("boom")));
    hooks.on_request_fn("panics", |_flow, _ctx| panic!("hook panicked"));
  })
  .await;
  let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  let response = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  proxy.stop().await.unwrap();
}

async fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn refused_upstream_yields_bad_gateway() {
  let port = closed_port().await;
  let (proxy, _) = start_proxy(config(), |_| {}).await;
  let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  let response = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  assert!(response.validate().is_ok());

  // the listener keeps accepting after a failed connection
  let again = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(again.status(), StatusCode::BAD_GATEWAY);
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn refused_upstream_closes_cleanly_without_error_pages() {
  let port = closed_port().await;
  let (proxy, _) = start_proxy(config().with_synthetic_errors(false), |_| {}).await;
  let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut rest = Vec::new();
  let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
    .await
    .unwrap()
    .unwrap_or(0);
  assert_eq!(n, 0);
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_header_is_never_forwarded() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = origin.local_addr().unwrap().port();
  let mut limits = config();
  limits.max_header_bytes = 1024;
  let (proxy, _) = start_proxy(limits, |_| {}).await;

  let mut raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Big: ").into_bytes();
  raw.extend(std::iter::repeat(b'a').take(8 * 1024));
  raw.extend_from_slice(b"\r\n\r\n");
  let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let _ = stream.write_all(&raw).await;
  let mut status = [0u8; 13];
  tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut status))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&status, b"HTTP/1.1 431 ");

  let accepted = tokio::time::timeout(Duration::from_millis(300), origin.accept()).await;
  assert!(accepted.is_err(), "the origin must not see the request");
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_serves_several_flows() {
  let (port, mut seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), |_| {}).await;
  let stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let mut reader = tapwire::MessageReader::new(stream, tapwire::ParseLimits::default());
  for path in ["/one", "/two"] {
    let raw = format!("GET http://127.0.0.1:{port}{path} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
    reader.get_mut().write_all(raw.as_bytes()).await.unwrap();
    let response = reader.read_response(&tapwire::Method::GET).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(seen.recv().await.unwrap().target(), path);
  }
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn expect_continue_is_answered_and_stripped() {
  let (port, mut seen) = spawn_origin(HELLO).await;
  let (proxy, _) = start_proxy(config(), |_| {}).await;
  let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let head = format!(
    "POST http://127.0.0.1:{port}/upload HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n"
  );
  stream.write_all(head.as_bytes()).await.unwrap();
  let mut interim = [0u8; 25];
  stream.read_exact(&mut interim).await.unwrap();
  assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");
  stream.write_all(b"data").await.unwrap();

  let mut reader = tapwire::MessageReader::new(stream, tapwire::ParseLimits::default());
  let response = reader.read_response(&tapwire::Method::POST).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let upstream = seen.recv().await.unwrap();
  assert!(!upstream.headers().contains("expect"));
  assert_eq!(&upstream.body()[..], b"data");
  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn silent_upstream_hits_the_flow_timeout() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = origin.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = origin.accept().await {
      tokio::spawn(async move {
        let mut sink = [0u8; 1024];
        while let Ok(n) = stream.read(&mut sink).await {
          if n == 0 {
            break;
          }
        }
      });
    }
  });
  let config = config()
    .with_response_header_timeout(Duration::from_secs(30))
    .with_flow_timeout(Duration::from_millis(300));
  let (proxy, _) = start_proxy(config, |_| {}).await;

  let raw = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  let response = tokio::time::timeout(Duration::from_secs(5), roundtrip(proxy.local_addr(), raw.as_bytes()))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
  assert!(response.validate().is_ok());
  proxy.stop().await.unwrap();
}

fn two_pixels() -> Vec<u8> {
  let mut image = image::RgbaImage::new(2, 1);
  image.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
  image.put_pixel(1, 0, image::Rgba([0, 0, 255, 255]));
  let mut out = Cursor::new(Vec::new());
  image::DynamicImage::ImageRgba8(image)
    .write_to(&mut out, image::ImageFormat::Gif)
    .unwrap();
  out.into_inner()
}

struct Rotate;

#[async_trait::async_trait]
impl ResponseHook for Rotate {
  async fn on_response(&self, flow: &mut Flow, _ctx: &HookContext) -> Result<(), HookError> {
    let Some(response) = flow.response_mut() else {
      return Ok(());
    };
    if !response.content_type().is_some_and(|m| m.type_() == mime::IMAGE) {
      return Ok(());
    }
    let original = response.decoded_body().map_err(|e| HookError::msg(e.to_string()))?;
    let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
      let image = image::load_from_memory(&original).map_err(|e| e.to_string())?;
      let mut out = Cursor::new(Vec::new());
      image
        .rotate180()
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| e.to_string())?;
      Ok(out.into_inner())
    })
    .await
    .map_err(|e| HookError::msg(e.to_string()))?
    .map_err(HookError::msg)?;
    response.set_decoded_body(png.into());
    response.headers_mut().set("Content-Type", "image/png");
    Ok(())
  }
}

#[tokio::test]
async fn images_are_transformed_on_the_blocking_pool() {
  let gif = two_pixels();
  let mut wire = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: image/gif\r\nContent-Length: {}\r\n\r\n",
    gif.len()
  )
  .into_bytes();
  wire.extend_from_slice(&gif);
  let (port, _seen) = spawn_origin(Box::leak(wire.into_boxed_slice())).await;
  let (proxy, _) = start_proxy(config(), |hooks| {
    hooks.on_response("rotate", Rotate);
  })
  .await;

  let raw = format!("GET http://127.0.0.1:{port}/cat.gif HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
  let response = roundtrip(proxy.local_addr(), raw.as_bytes()).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.headers().get("content-type"), Some("image/png"));
  assert_eq!(response.content_length(), Some(response.body().len() as u64));

  let decoded = image::load_from_memory_with_format(response.body(), image::ImageFormat::Png)
    .unwrap()
    .to_rgb8();
  assert_eq!(decoded.dimensions(), (2, 1));
  let left = decoded.get_pixel(0, 0);
  assert!(left[2] > left[0], "left pixel should be blue after rotation: {:?}", left);
  proxy.stop().await.unwrap();
}
