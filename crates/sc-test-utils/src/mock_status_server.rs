// mock_status_server: A scripted WebSocket status server for testing the client.
//
// Each accepted connection consumes the next `SessionScript` from a queue:
// the scripted frames are written in order, then the connection either stays
// open, sends a close frame, or is dropped without one. Connections that stay
// open receive anything pushed with `MockStatusServer::push` and have their
// inbound text frames captured for later inspection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sc_protocol::MessageEnvelope;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::Message;

/// One frame written by the server.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Serialized as JSON text.
    Envelope(MessageEnvelope),
    /// Written verbatim; used for malformed input.
    Raw(String),
    /// Pause before the next frame.
    Delay(Duration),
}

/// What happens after the scripted frames are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFrames {
    StayOpen,
    /// Send a close frame.
    Close,
    /// Drop the socket without a close handshake.
    Drop,
}

/// Behaviour for a single accepted connection.
#[derive(Debug, Clone)]
pub struct SessionScript {
    pub frames: Vec<Frame>,
    pub then: AfterFrames,
}

impl SessionScript {
    pub fn stay_open(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            then: AfterFrames::StayOpen,
        }
    }

    pub fn close_after(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            then: AfterFrames::Close,
        }
    }

    pub fn drop_after(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            then: AfterFrames::Drop,
        }
    }
}

impl Default for SessionScript {
    fn default() -> Self {
        Self::stay_open(Vec::new())
    }
}

struct Shared {
    scripts: StdMutex<VecDeque<SessionScript>>,
    auth_headers: StdMutex<Vec<Option<String>>>,
    required_token: Option<String>,
    connections: AtomicUsize,
    push_tx: broadcast::Sender<String>,
    inbound_tx: mpsc::UnboundedSender<String>,
}

/// A mock status server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address. Each test
/// spins up its own isolated instance; the accept loop is aborted on drop.
pub struct MockStatusServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockStatusServer {
    /// Start a server that accepts any (or no) bearer token.
    pub async fn start(scripts: Vec<SessionScript>) -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_inner(scripts, None).await
    }

    /// Start a server that rejects the upgrade with 401 unless the request
    /// carries `Authorization: Bearer <token>`.
    pub async fn start_with_token(
        scripts: Vec<SessionScript>,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_inner(scripts, Some(token.to_owned())).await
    }

    async fn start_inner(
        scripts: Vec<SessionScript>,
        required_token: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (push_tx, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            scripts: StdMutex::new(scripts.into()),
            auth_headers: StdMutex::new(Vec::new()),
            required_token,
            connections: AtomicUsize::new(0),
            push_tx,
            inbound_tx,
        });

        let task = tokio::spawn(Self::accept_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            addr,
            shared,
            inbound_rx: Mutex::new(inbound_rx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of completed WebSocket handshakes so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Authorization header values seen on each handshake, in order.
    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.shared.auth_headers.lock().unwrap().clone()
    }

    /// Send an envelope to every connection currently in the stay-open phase.
    pub fn push(&self, envelope: &MessageEnvelope) -> usize {
        let json = serde_json::to_string(envelope).expect("serialize envelope");
        self.shared.push_tx.send(json).unwrap_or(0)
    }

    /// Next text frame the client sent, or `None` after `wait` elapses.
    pub async fn next_inbound(&self, wait: Duration) -> Option<String> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                // Client drops are expected in tests.
                let _ = Self::handle_connection(stream, shared).await;
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let seen_auth = Arc::new(StdMutex::new(None::<String>));
        let callback = {
            let seen_auth = Arc::clone(&seen_auth);
            let required = shared.required_token.clone();
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                *seen_auth.lock().unwrap() = auth.clone();
                if let Some(token) = required {
                    if auth.as_deref() != Some(format!("Bearer {token}").as_str()) {
                        let reject = http::Response::builder()
                            .status(http::StatusCode::UNAUTHORIZED)
                            .body(Some("invalid token".to_owned()))
                            .expect("static response");
                        return Err(reject);
                    }
                }
                Ok(resp)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        let auth = seen_auth.lock().unwrap().take();
        shared.auth_headers.lock().unwrap().push(auth);
        let ws = ws?;
        shared.connections.fetch_add(1, Ordering::SeqCst);

        let script = shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let mut push_rx = shared.push_tx.subscribe();
        let (mut write, mut read) = ws.split();

        for frame in script.frames {
            match frame {
                Frame::Envelope(env) => {
                    let json = serde_json::to_string(&env)?;
                    write.send(Message::Text(json.into())).await?;
                }
                Frame::Raw(text) => write.send(Message::Text(text.into())).await?,
                Frame::Delay(d) => tokio::time::sleep(d).await,
            }
        }

        match script.then {
            AfterFrames::Drop => return Ok(()),
            AfterFrames::Close => {
                write.send(Message::Close(None)).await?;
                // Drain until the client acknowledges the close.
                while let Some(Ok(msg)) = read.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
                return Ok(());
            }
            AfterFrames::StayOpen => {}
        }

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(t))) => {
                        let _ = shared.inbound_tx.send(t.to_string());
                    }
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                pushed = push_rx.recv() => match pushed {
                    Ok(json) => write.send(Message::Text(json.into())).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

impl Drop for MockStatusServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
