//! Proxy facade: configuration, root certificate and hooks in, running server out
use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::ProxyConfig;
use crate::errors::{new_io_error, Error, Result};
use crate::hook::HookRegistry;
use crate::server::ProxyServer;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// An intercepting proxy that has not started serving yet.
///
/// Hooks are registered here; starting the proxy freezes them.
pub struct MitmProxy {
  config: ProxyConfig,
  certs: CertificateManager,
  hooks: HookRegistry,
}

impl MitmProxy {
  /// Create a proxy, loading or generating the root certificate the
  /// configuration points at.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let ca = match (&config.ca_cert_path, &config.ca_key_path) {
      (Some(cert), Some(key)) => CertificateAuthority::from_pem_files(cert, key).await?,
      _ => CertificateAuthority::load_or_generate(&config.ca_storage_path).await?,
    };
    Self::with_authority(config, ca)
  }

  /// Create a proxy around an already loaded root.
  pub fn with_authority(config: ProxyConfig, ca: CertificateAuthority) -> Result<Self> {
    config.validate()?;
    let certs = CertificateManager::new(ca, config.leaf_validity);
    let mut hooks = HookRegistry::new();
    hooks.set_failure_policy(config.hook_failure);
    Ok(MitmProxy {
      config,
      certs,
      hooks,
    })
  }

  /// The configuration the proxy will run with.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Hook registry, open until the proxy starts.
  pub fn hooks(&mut self) -> &mut HookRegistry {
    &mut self.hooks
  }

  /// Root certificate in PEM form.
  ///
  /// This certificate should be installed in the client's trust store
  pub fn ca_cert_pem(&self) -> &str {
    self.certs.ca_cert_pem()
  }

  /// Root certificate path, when the root lives on disk.
  pub fn ca_cert_path(&self) -> Option<&Path> {
    self.certs.ca_cert_path()
  }

  /// Leaf signer, shared with the running server.
  pub fn certificates(&self) -> &CertificateManager {
    &self.certs
  }

  /// Bind the listen address and start serving in the background.
  pub async fn start(self) -> Result<ProxyHandle> {
    let listener = TcpListener::bind(self.config.listen_addr).await.map_err(|e| {
      Error::config(format!("cannot listen on {}: {}", self.config.listen_addr, e))
    })?;
    let local_addr = listener.local_addr()?;
    let pipeline = self.hooks.freeze();
    let server = ProxyServer::new(self.config, self.certs, pipeline)?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
    Ok(ProxyHandle {
      local_addr,
      shutdown_tx,
      task,
    })
  }

  /// Serve until Ctrl-C, then shut down gracefully.
  pub async fn run(self) -> Result<()> {
    let handle = self.start().await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl-C");
    handle.stop().await
  }
}

impl std::fmt::Debug for MitmProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MitmProxy")
      .field("config", &self.config)
      .field("hooks", &self.hooks.len())
      .finish_non_exhaustive()
  }
}

/// Handle for controlling a running proxy.
#[derive(Debug)]
pub struct ProxyHandle {
  local_addr: SocketAddr,
  shutdown_tx: broadcast::Sender<()>,
  task: JoinHandle<Result<()>>,
}

impl ProxyHandle {
  /// Address the proxy is listening on.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections; in-flight ones drain for the shutdown grace.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(());
  }

  /// Wait for the proxy to finish.
  pub async fn wait(self) -> Result<()> {
    self
      .task
      .await
      .map_err(|e| Error::IO(new_io_error(std::io::ErrorKind::Other, &e.to_string())))?
  }

  /// Shut down and wait for the proxy to finish.
  pub async fn stop(self) -> Result<()> {
    self.shutdown();
    self.wait().await
  }
}
