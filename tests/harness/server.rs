//! Spawnable TCP test server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use wsmux::{Config, Conn, Status, Upgrader};

/// A WebSocket test server bound to an OS-assigned port.
pub struct TestServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: SocketAddr,
}

impl TestServer {
    /// Spawn an echo server with the default configuration.
    pub async fn spawn() -> (Self, SocketAddr) {
        Self::spawn_with(Config::new(), echo).await
    }

    /// Spawn a server running `handler` for every accepted connection.
    pub async fn spawn_with<F, Fut>(config: Config, handler: F) -> (Self, SocketAddr)
    where
        F: Fn(Conn<TcpStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(Self::run(listener, config, Arc::new(handler), shutdown_rx));

        (
            TestServer {
                shutdown_tx: Some(shutdown_tx),
                addr,
            },
            addr,
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    async fn run<F, Fut>(
        listener: TcpListener,
        config: Config,
        handler: Arc<F>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) where
        F: Fn(Conn<TcpStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let upgrader = Arc::new(Upgrader::new(config));
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { break };
                    let upgrader = Arc::clone(&upgrader);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Ok(conn) = upgrader.accept_from(stream, peer).await {
                            handler(conn).await;
                        }
                    });
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Echo handler: repeats every message back with the same kind, then
/// closes normally once the peer closes or errors out.
pub async fn echo(conn: Conn<TcpStream>) {
    loop {
        match conn.receive_message().await {
            Ok((kind, mut reader)) => {
                let mut payload = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => payload.extend_from_slice(&chunk[..n]),
                        Err(_) => return,
                    }
                }
                let sent = match kind {
                    wsmux::MessageKind::Text => match String::from_utf8(payload) {
                        Ok(text) => conn.send_text(&text).await,
                        Err(_) => return,
                    },
                    wsmux::MessageKind::Binary => conn.send_binary(&payload).await,
                };
                if sent.is_err() {
                    return;
                }
            }
            Err(_) => {
                let _ = conn.close(Status::Normal, "").await;
                return;
            }
        }
    }
}
