//! TCP acceptor for the command server.
//!
//! Binds the configured address and spawns a [`ClientConn`] task for each
//! accepted connection. The number of connections served at once is capped
//! by a semaphore; further clients wait in the listen backlog.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client_conn::ClientConn;
use super::registry::DeviceRegistry;
use crate::config::ServerSettings;

/// Running command server.
#[derive(Debug)]
pub struct CommandServer {
    local_addr: SocketAddr,
    registry: DeviceRegistry,
    shutdown: CancellationToken,
    accept_handle: JoinHandle<()>,
}

impl CommandServer {
    /// Bind and start accepting connections.
    ///
    /// Port 0 binds an ephemeral port; see [`CommandServer::local_addr`].
    pub async fn start(settings: &ServerSettings, registry: DeviceRegistry) -> Result<Self> {
        let bind = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind command server on {bind}"))?;
        let local_addr = listener.local_addr()?;

        log::info!(
            "[CommandServer] listening on {local_addr} ({} device(s), max {} connection(s))",
            registry.len(),
            settings.max_connections
        );

        let shutdown = CancellationToken::new();
        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            registry.clone(),
            Arc::new(Semaphore::new(settings.max_connections.max(1))),
            settings.max_packet,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            accept_handle,
        })
    }

    /// Accept loop - runs as a tokio task.
    async fn accept_loop(
        listener: TcpListener,
        registry: DeviceRegistry,
        slots: Arc<Semaphore>,
        max_packet: usize,
        shutdown: CancellationToken,
    ) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = shutdown.cancelled() => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    log::info!("[CommandServer] connection from {peer}");
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        ClientConn::serve(stream, peer, registry, max_packet, shutdown).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    log::error!("[CommandServer] accept error: {e}");
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        log::info!("[CommandServer] accept loop stopped");
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Devices served by this server.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Stop accepting and close all client connections.
    ///
    /// Devices are left running; close them through the registry.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.accept_handle.await {
            log::warn!("[CommandServer] accept loop ended abnormally: {e}");
        }
        log::info!("[CommandServer] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AsyncDevice;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn loopback() -> ServerSettings {
        ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        }
    }

    async fn roundtrip(stream: &mut TcpStream, request: &str) -> String {
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("Timed out waiting for reply")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_probe_and_disconnected_device() {
        let registry = DeviceRegistry::new();
        registry.insert(AsyncDevice::disconnected("GAUGE"));
        let server = CommandServer::start(&loopback(), registry).await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        assert_eq!(
            roundtrip(&mut stream, "GAUGE").await,
            "2-Device connection is not established"
        );
        assert!(roundtrip(&mut stream, "PUMP:on()").await.starts_with("1-Device PUMP"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_client_connections() {
        let server = CommandServer::start(&loopback(), DeviceRegistry::new()).await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        // Make sure the connection was accepted before shutting down.
        assert!(roundtrip(&mut stream, "X").await.starts_with("1-"));

        server.shutdown().await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
