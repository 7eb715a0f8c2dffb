//! In-process relay for integration tests.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, Keys};
use nostr_client::{ClientMessage, RelayMessage};
use std::sync::Once;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A listening socket that speaks just enough NIP-01 to script a relay.
pub struct MockRelay {
    listener: TcpListener,
    url: String,
}

impl MockRelay {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            listener,
            url: format!("ws://127.0.0.1:{}/", port),
        }
    }

    /// Normalized URL, as the client reports it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Accept the next client and complete the WebSocket handshake.
    pub async fn accept(&self) -> MockPeer {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        let ws = accept_async(stream).await.unwrap();
        MockPeer { ws }
    }

    /// Accept a client that completes the handshake within `wait`, if any.
    pub async fn accept_within(&self, wait: Duration) -> Option<MockPeer> {
        let deadline = Instant::now() + wait;
        loop {
            let (stream, _) = timeout_at(deadline, self.listener.accept()).await.ok()?.ok()?;
            // A client that gave up mid-handshake does not count.
            if let Ok(Ok(ws)) = timeout_at(deadline, accept_async(stream)).await {
                return Some(MockPeer { ws });
            }
        }
    }
}

/// A URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ws://127.0.0.1:{}/", port)
}

/// The relay's end of one client connection.
pub struct MockPeer {
    ws: WebSocketStream<TcpStream>,
}

impl MockPeer {
    /// Next client frame, skipping control frames.
    pub async fn recv_frame(&mut self) -> ClientMessage {
        loop {
            let message = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("no frame from client")
                .expect("client hung up")
                .unwrap();
            match message {
                Message::Text(text) => return ClientMessage::from_json(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    /// Receive a `REQ` and return its subscription id.
    pub async fn recv_req(&mut self) -> String {
        match self.recv_frame().await {
            ClientMessage::Req {
                subscription_id, ..
            } => subscription_id,
            other => panic!("expected REQ, got {:?}", other),
        }
    }

    /// Receive an `EVENT` publish.
    pub async fn recv_event(&mut self) -> Event {
        match self.recv_frame().await {
            ClientMessage::Event(event) => event,
            other => panic!("expected EVENT, got {:?}", other),
        }
    }

    /// Wait until the client closes the connection or drops the socket.
    pub async fn expect_hangup(&mut self) {
        loop {
            let message = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("client did not hang up");
            match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn send(&mut self, message: &RelayMessage) {
        self.send_raw(&message.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, frame: &str) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    pub async fn send_event(&mut self, subscription_id: &str, event: &Event) {
        self.send(&RelayMessage::Event {
            subscription_id: subscription_id.to_string(),
            event: event.clone(),
        })
        .await;
    }

    pub async fn send_eose(&mut self, subscription_id: &str) {
        self.send(&RelayMessage::Eose {
            subscription_id: subscription_id.to_string(),
        })
        .await;
    }

    pub async fn send_ok(&mut self, event_id: &str, success: bool, message: &str) {
        self.send(&RelayMessage::Ok {
            event_id: event_id.to_string(),
            success,
            message: message.to_string(),
        })
        .await;
    }
}

pub fn note(keys: &Keys, content: &str) -> Event {
    keys.sign(&EventTemplate::now(1, vec![], content)).unwrap()
}
