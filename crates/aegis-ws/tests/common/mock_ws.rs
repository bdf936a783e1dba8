//! Mock WebSocket server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections and count them
//! - Record received text frames and close codes
//! - Push frames to every connected client
//! - Drop every connection without a close handshake
//! - Optionally answer `{"type":"ping"}` with `{"type":"pong"}`

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum ServerCommand {
    Text(String),
    DropAll,
}

struct ServerState {
    messages: Mutex<Vec<String>>,
    close_codes: Mutex<Vec<u16>>,
    connections: AtomicU32,
    reply_pong: AtomicBool,
    commands: broadcast::Sender<ServerCommand>,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<ServerState>,
}

impl MockWsServer {
    /// Start a new mock WebSocket server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            messages: Mutex::new(Vec::new()),
            close_codes: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            reply_pong: AtomicBool::new(true),
            commands,
        });
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let state_clone = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, state_clone.clone()));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            state,
        }
    }

    /// Get the server's WebSocket URL for a path.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Whether application-level pings are answered.
    pub fn set_reply_pong(&self, reply: bool) {
        self.state.reply_pong.store(reply, Ordering::SeqCst);
    }

    /// Number of completed handshakes.
    pub fn connection_count(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// All text frames received from clients.
    pub fn received_messages(&self) -> Vec<String> {
        self.state.messages.lock().clone()
    }

    /// Close codes sent by clients.
    pub fn close_codes(&self) -> Vec<u16> {
        self.state.close_codes.lock().clone()
    }

    /// Send a text frame to every connected client.
    pub fn broadcast(&self, text: &str) {
        let _ = self
            .state
            .commands
            .send(ServerCommand::Text(text.to_string()));
    }

    /// Drop every connection without a close frame.
    pub fn drop_all_connections(&self) {
        let _ = self.state.commands.send(ServerCommand::DropAll);
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    // Subscribe before counting so a test that saw the count sees broadcasts.
    let mut commands = state.commands.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Ok(ServerCommand::Text(text)) => {
                        let _ = write.send(Message::Text(text)).await;
                    }
                    Ok(ServerCommand::DropAll) | Err(_) => return,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.messages.lock().push(text.clone());

                        let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                            .map(|v| v.get("type") == Some(&serde_json::json!("ping")))
                            .unwrap_or(false);
                        if is_ping && state.reply_pong.load(Ordering::SeqCst) {
                            let _ = write
                                .send(Message::Text(r#"{"type":"pong"}"#.to_string()))
                                .await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                        state.close_codes.lock().push(code);
                        break;
                    }
                    Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}
