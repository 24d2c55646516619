#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use relay_client::{ClientConfig, ClientEvent, ReconnectPolicy};

/// How the fake relay treats the next incoming connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Upgrade and send `ready`.
    Accept,
    /// Refuse the upgrade with HTTP 401.
    RejectAuth,
    /// Drop the TCP connection before the upgrade.
    Hangup,
    /// Upgrade but never send `ready`.
    Silent,
}

/// A minimal in-test relay that can drop connections on cue.
pub struct FakeRelay {
    pub addr: SocketAddr,
    mode: Arc<Mutex<Mode>>,
    attempts: Arc<AtomicUsize>,
    peers: mpsc::UnboundedReceiver<Peer>,
}

/// One upgraded connection as seen by the fake relay. Dropping it drops the
/// connection.
pub struct Peer {
    pub auth: Option<String>,
    frames: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl FakeRelay {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap();
        let mode = Arc::new(Mutex::new(mode));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (peers_tx, peers) = mpsc::unbounded_channel();

        let accept_mode = mode.clone();
        let accept_attempts = attempts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = accept_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let mode = *accept_mode.lock().unwrap();
                tokio::spawn(serve_peer(stream, mode, n, peers_tx.clone()));
            }
        });

        Self {
            addr,
            mode,
            attempts,
            peers,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/gateway", self.addr)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// TCP connections accepted so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_peer(&mut self) -> Peer {
        time::timeout(Duration::from_secs(5), self.peers.recv())
            .await
            .expect("timeout waiting for peer")
            .expect("relay stopped")
    }
}

impl Peer {
    pub async fn next_frame(&mut self) -> Value {
        let text = time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timeout waiting for frame")
            .expect("peer gone");
        serde_json::from_str(&text).expect("parse frame")
    }

    pub fn push(&self, frame: Value) {
        self.push.send(frame.to_string()).expect("peer gone");
    }

    /// Drop the transport without a close handshake.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn serve_peer(stream: TcpStream, mode: Mode, n: usize, peers: mpsc::UnboundedSender<Peer>) {
    if mode == Mode::Hangup {
        drop(stream);
        return;
    }

    let mut auth = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if mode == Mode::RejectAuth {
            let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
            *err.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(err);
        }
        Ok(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    if mode != Mode::Silent {
        let ready = json!({
            "event": "ready",
            "data": { "connectionId": format!("conn_{n}"), "userIdentity": "buyer-1" }
        });
        if ws.send(Message::Text(ready.to_string().into())).await.is_err() {
            return;
        }
    }

    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (push, mut push_rx) = mpsc::unbounded_channel::<String>();
    let (kill, mut kill_rx) = oneshot::channel();
    let _ = peers.send(Peer {
        auth,
        frames,
        push,
        kill: Some(kill),
    });

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames_tx.send(text.to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            Some(text) = push_rx.recv() => {
                let _ = ws.send(Message::Text(text.into())).await;
            }
            _ = &mut kill_rx => return,
        }
    }
}

/// Fast reconnection for tests: three attempts, 20 ms apart.
pub fn fast_config(relay: &FakeRelay) -> ClientConfig {
    ClientConfig::new(relay.url(), "tok")
        .with_reconnect(ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..ReconnectPolicy::default()
        })
        .with_handshake_timeout(Duration::from_millis(500))
}

pub async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event channel closed")
}
