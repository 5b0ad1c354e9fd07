//! TCP listener
//!
//! Accepts importer connections and drives one session per connection on
//! its own task. The concurrent-connection cap is a semaphore; a connection
//! that arrives with no permit left is refused outright.

use crate::config::ServerConfig;
use crate::net::session;
use anyhow::{Context, Result};
use common::DeviceRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub struct Listener {
    config: Arc<ServerConfig>,
    registry: Arc<dyn DeviceRegistry>,
}

impl Listener {
    pub fn new(config: Arc<ServerConfig>, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { config, registry }
    }

    /// Accept connections until the surrounding task is cancelled
    pub async fn run(&self) -> Result<()> {
        let bind = (
            self.config.server.bind_address.as_str(),
            self.config.server.port,
        );
        let listener = TcpListener::bind(bind).await.with_context(|| {
            format!(
                "Failed to bind {}:{}",
                self.config.server.bind_address, self.config.server.port
            )
        })?;
        info!(address = %listener.local_addr()?, "listening for importers");

        let permits = Arc::new(Semaphore::new(self.config.limits.max_connections as usize));

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let Ok(permit) = permits.clone().try_acquire_owned() else {
                warn!(peer = %peer, "connection limit reached, refusing");
                continue;
            };

            let _ = stream.set_nodelay(true);

            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) =
                    session::run_session(stream, peer.to_string(), registry, config).await
                {
                    error!(peer = %peer, "session error: {:#}", e);
                }
            });
        }
    }
}
