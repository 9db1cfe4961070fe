// flaky_listener: A TCP listener that never completes a WebSocket handshake.
// It either drops every connection at once or accepts and then sits on it
// without ever answering the upgrade request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;

/// Counts connection attempts while refusing to speak WebSocket.
pub struct FlakyListener {
    addr: SocketAddr,
    attempts: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl FlakyListener {
    /// Accept and immediately drop every connection.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::spawn(false).await
    }

    /// Accept every connection and hold it open in silence.
    pub async fn start_silent() -> Result<Self, Box<dyn std::error::Error>> {
        Self::spawn(true).await
    }

    async fn spawn(hold: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _peer)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if hold {
                    held.push(stream);
                } else {
                    drop(stream);
                }
            }
        });

        Ok(Self {
            addr,
            attempts,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for FlakyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
