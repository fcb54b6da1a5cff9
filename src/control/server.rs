//! Control-protocol TCP server (spec §4.10): accepts connections and hands
//! each one to its own task, matching the per-connection task shape the
//! teacher uses for its network server accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::control::backend::ControlBackend;
use crate::control::session;
use crate::error::Result;

pub struct ControlServer {
    listener: TcpListener,
    backend: Arc<dyn ControlBackend>,
    auth_key: Option<String>,
}

impl ControlServer {
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<dyn ControlBackend>,
        auth_key: Option<String>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            backend,
            auth_key,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until `shutdown` resolves.
    pub async fn serve(self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "control connection accepted");
                            let backend = self.backend.clone();
                            let auth_key = self.auth_key.clone();
                            tokio::spawn(async move {
                                session::run(stream, backend, auth_key).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "control accept failed"),
                    }
                }
                _ = &mut shutdown => return,
            }
        }
    }
}
