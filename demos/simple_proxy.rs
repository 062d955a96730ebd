//! Intercepting proxy that only logs traffic
//!
//! Takes an optional JSON configuration file as its first argument.
//!
//! To run:
//! ```bash
//! cargo run --example simple_proxy -- proxy.json
//! ```
use tapwire::{HttpMessage, MitmProxy, ProxyConfig};
use tracing_subscriber::EnvFilter;

async fn build() -> tapwire::Result<MitmProxy> {
  let config = match std::env::args().nth(1) {
    Some(path) => ProxyConfig::from_json_file(path)?,
    None => ProxyConfig::default(),
  };
  let mut proxy = MitmProxy::new(config).await?;
  proxy.hooks().on_request_fn("log-request", |flow, ctx| {
    let request = flow.request();
    ctx.info(format!(
      "{} {} {} ({} bytes)",
      flow.client().addr,
      request.method(),
      flow.destination(),
      request.body().len()
    ));
    Ok(())
  });
  proxy.hooks().on_response_fn("log-response", |flow, ctx| {
    if let Some(response) = flow.response() {
      ctx.info(format!(
        "{} {} ({} bytes)",
        flow.request().path(),
        response.status(),
        response.body().len()
      ));
    }
    Ok(())
  });
  Ok(proxy)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let proxy = match build().await {
    Ok(proxy) => proxy,
    Err(err) => {
      eprintln!("failed to start proxy: {}", err);
      std::process::exit(1);
    }
  };
  println!("Listening on {}", proxy.config().listen_addr);
  match proxy.ca_cert_path() {
    Some(path) => println!("Root certificate: {}", path.display()),
    None => println!("{}", proxy.ca_cert_pem()),
  }
  if let Err(err) = proxy.run().await {
    eprintln!("proxy stopped: {}", err);
    std::process::exit(1);
  }
}
