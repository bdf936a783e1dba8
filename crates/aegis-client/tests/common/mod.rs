//! Shared helpers for service integration tests.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// WebSocket endpoint that accepts connections and records close codes.
pub struct WsEndpoint {
    url: String,
    connections: Arc<AtomicU32>,
    close_codes: Arc<Mutex<Vec<u16>>>,
}

impl WsEndpoint {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicU32::new(0));
        let close_codes = Arc::new(Mutex::new(Vec::new()));

        let (conn_count, codes) = (connections.clone(), close_codes.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (conn_count, codes) = (conn_count.clone(), codes.clone());
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    conn_count.fetch_add(1, Ordering::SeqCst);
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Close(frame) = msg {
                            codes
                                .lock()
                                .push(frame.map(|f| u16::from(f.code)).unwrap_or(1005));
                            break;
                        }
                    }
                });
            }
        });

        Self {
            url,
            connections,
            close_codes,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.close_codes.lock().clone()
    }
}

/// Poll `cond` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
