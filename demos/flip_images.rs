//! Turn every image upside down
//!
//! JPEG, PNG and GIF responses are decoded, rotated by 180 degrees and
//! re-encoded as PNG.
//!
//! To run:
//! ```bash
//! cargo run --example flip_images
//! ```
use std::io::Cursor;
use tapwire::{Flow, HookContext, HookError, HttpMessage, MitmProxy, ProxyConfig, ResponseHook};
use tracing_subscriber::EnvFilter;

fn is_flippable(mime: &mime::Mime) -> bool {
  mime.type_() == mime::IMAGE
    && matches!(mime.subtype().as_str(), "jpeg" | "jpg" | "png" | "gif")
}

fn flip(bytes: &[u8]) -> Result<Vec<u8>, HookError> {
  let image = image::load_from_memory(bytes).map_err(|e| HookError::msg(e.to_string()))?;
  let mut out = Cursor::new(Vec::new());
  image
    .rotate180()
    .write_to(&mut out, image::ImageFormat::Png)
    .map_err(|e| HookError::msg(e.to_string()))?;
  Ok(out.into_inner())
}

/// Decoding and encoding run on the blocking pool.
struct FlipImages;

#[async_trait::async_trait]
impl ResponseHook for FlipImages {
  async fn on_response(&self, flow: &mut Flow, ctx: &HookContext) -> Result<(), HookError> {
    let Some(response) = flow.response_mut() else {
      return Ok(());
    };
    if !response.content_type().is_some_and(|m| is_flippable(&m)) {
      return Ok(());
    }
    let original = response
      .decoded_body()
      .map_err(|e| HookError::msg(e.to_string()))?;
    let size = original.len();
    let flipped = tokio::task::spawn_blocking(move || flip(&original))
      .await
      .map_err(|e| HookError::msg(e.to_string()))??;
    ctx.info(format!("flipped {} byte image", size));
    response.set_decoded_body(flipped.into());
    response.headers_mut().set("Content-Type", "image/png");
    Ok(())
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut proxy = match MitmProxy::new(ProxyConfig::default()).await {
    Ok(proxy) => proxy,
    Err(err) => {
      eprintln!("failed to start proxy: {}", err);
      std::process::exit(1);
    }
  };

  proxy.hooks().on_response("flip-images", FlipImages);

  println!("Listening on {}", proxy.config().listen_addr);
  if let Some(path) = proxy.ca_cert_path() {
    println!("Install the root certificate from {}", path.display());
  }
  if let Err(err) = proxy.run().await {
    eprintln!("proxy stopped: {}", err);
    std::process::exit(1);
  }
}
