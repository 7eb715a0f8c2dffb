//! Single relay connection management
//!
//! A [`RelayConnection`] owns one WebSocket to one relay. Connecting spawns
//! two tasks: a writer draining a bounded outbound queue, and a reader that
//! decodes frames in arrival order. The reader resolves `OK` frames against
//! the pending-ack table, hands subscription frames to the
//! [`SubscriptionRouter`], and broadcasts `NOTICE`s. Malformed frames are
//! logged and skipped.
//!
//! When the transport drops, every pending publish fails with
//! [`ClientError::ConnectionLost`] and every subscription closes with
//! [`CloseReason::ConnectionLost`]. Reconnecting is explicit
//! ([`RelayConnection::reconnect_with_backoff`]); the pool decides whether
//! to resubscribe.

use crate::backoff::ExponentialBackoff;
use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::subscription::{CloseReason, Subscription, SubscriptionMode, SubscriptionRouter};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` lets the writer flush and send the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Graceful shutdown in progress
    Closing,
}

/// A relay accepted a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    /// Optional message from the relay (often empty)
    pub message: String,
}

/// Connection-level events, broadcast to anyone listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    Connected {
        relay_url: String,
    },
    /// `unexpected` is false after a local `disconnect`.
    Disconnected {
        relay_url: String,
        unexpected: bool,
    },
    Notice {
        relay_url: String,
        message: String,
    },
}

/// Validate a relay URL: `ws://` or `wss://` with a host.
pub fn parse_relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())?;

    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ClientError::InvalidUrl(format!("URL has no host: {}", url)));
    }

    Ok(parsed)
}

/// rustls needs a process-wide crypto provider before the first `wss://` handshake.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug, Clone)]
struct AckOutcome {
    accepted: bool,
    message: String,
}

/// Publishers waiting for `OK`, keyed by event id.
///
/// The same event may be published concurrently; each waiter gets a token so
/// it can withdraw without disturbing the others.
#[derive(Default)]
struct AckTable {
    next_token: u64,
    waiters: HashMap<String, Vec<(u64, oneshot::Sender<AckOutcome>)>>,
}

impl AckTable {
    fn register(&mut self, event_id: &str) -> (u64, oneshot::Receiver<AckOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.waiters
            .entry(event_id.to_string())
            .or_default()
            .push((token, tx));
        (token, rx)
    }

    /// Wake every waiter for `event_id`; returns how many there were.
    fn resolve(&mut self, event_id: &str, outcome: AckOutcome) -> usize {
        let Some(waiters) = self.waiters.remove(event_id) else {
            return 0;
        };
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    fn cancel(&mut self, event_id: &str, token: u64) {
        if let Some(waiters) = self.waiters.get_mut(event_id) {
            waiters.retain(|(t, _)| *t != token);
            if waiters.is_empty() {
                self.waiters.remove(event_id);
            }
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    fn fail_all(&mut self) -> usize {
        let count = self.len();
        self.waiters.clear();
        count
    }

    fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

/// Withdraws a publish waiter however the publish future ends.
struct AckGuard<'a> {
    table: &'a Mutex<AckTable>,
    event_id: &'a str,
    token: u64,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().cancel(self.event_id, self.token);
    }
}

struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Shared {
    url: Url,
    config: RelayConfig,
    state: Mutex<ConnectionState>,
    /// Bumped on every connect and disconnect; readers carry the value they
    /// were started with and are ignored once it moves on.
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending_acks: Mutex<AckTable>,
    router: Arc<SubscriptionRouter>,
    notifications: broadcast::Sender<RelayNotification>,
    backoff: Mutex<ExponentialBackoff>,
    tasks: Mutex<Option<ConnectionTasks>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn notify(&self, notification: RelayNotification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    fn try_send(&self, message: &ClientMessage) {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize frame for {}: {}", self.url, e);
                return;
            }
        };
        let Some(outbound) = self.outbound.lock().clone() else {
            return;
        };
        if let Err(e) = outbound.try_send(frame) {
            warn!("Outbound queue for {} rejected frame: {}", self.url, e);
        }
    }

    fn handle_frame(&self, text: &str, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        debug!("Received from {}: {}", self.url, text);

        match RelayMessage::from_json(text) {
            Err(e) => warn!("Discarding malformed frame from {}: {}", self.url, e),
            Ok(RelayMessage::Ok {
                event_id,
                success,
                message,
            }) => {
                let outcome = AckOutcome {
                    accepted: success,
                    message,
                };
                if self.pending_acks.lock().resolve(&event_id, outcome) == 0 {
                    debug!("OK from {} for {} with no waiting publisher", self.url, event_id);
                }
            }
            Ok(RelayMessage::Notice { message }) => {
                info!("NOTICE from {}: {}", self.url, message);
                self.notify(RelayNotification::Notice {
                    relay_url: self.url.to_string(),
                    message,
                });
            }
            Ok(message) => {
                if let Some(reply) = self.router.route(message) {
                    self.try_send(&reply);
                }
            }
        }
    }

    /// The relay answered on this transport, so later drops start the
    /// reconnect delays over. A relay that accepts and then hangs up at once
    /// keeps backing off.
    fn connection_proven(&self, generation: u64) {
        if self.is_current(generation) {
            self.backoff.lock().reset();
        }
    }

    /// Fail everything tied to the current transport.
    fn teardown(&self) -> (usize, usize) {
        self.outbound.lock().take();
        let acks = self.pending_acks.lock().fail_all();
        let subscriptions = self.router.close_all(CloseReason::ConnectionLost);
        (acks, subscriptions)
    }

    fn connection_lost(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if !self.is_current(generation) || *state != ConnectionState::Connected {
                debug!("Ignoring teardown from stale reader on {}", self.url);
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        // Called from the reader itself; only the writer is stopped here.
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.writer.abort();
        }
        let (acks, subscriptions) = self.teardown();
        warn!(
            "Lost connection to relay {} ({} pending acks failed, {} subscriptions closed)",
            self.url, acks, subscriptions
        );
        self.notify(RelayNotification::Disconnected {
            relay_url: self.url.to_string(),
            unexpected: true,
        });
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<String>,
    url: Url,
) {
    while let Some(frame) = outbound.recv().await {
        debug!("Sending to {}: {}", url, frame);
        if let Err(e) = sink.send(Message::text(frame)).await {
            warn!("Failed to send to {}: {}", url, e);
            break;
        }
    }
    // Senders gone: flush and send the close frame.
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>, generation: u64) {
    let mut heard_from_relay = false;
    while let Some(frame) = stream.next().await {
        if !heard_from_relay && matches!(&frame, Ok(message) if !message.is_close()) {
            heard_from_relay = true;
            shared.connection_proven(generation);
        }
        match frame {
            Ok(Message::Text(text)) => shared.handle_frame(text.as_str(), generation),
            Ok(Message::Close(frame)) => {
                info!("Relay {} closed connection: {:?}", shared.url, frame);
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from {}", shared.url);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error from {}: {}", shared.url, e);
                break;
            }
        }
    }
    shared.connection_lost(generation);
}

/// Relay connection
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<Shared>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str, config: RelayConfig) -> Result<Self> {
        let url = parse_relay_url(url)?;
        let (notifications, _) = broadcast::channel(256);

        Ok(Self {
            shared: Arc::new(Shared {
                router: Arc::new(SubscriptionRouter::new(
                    config.subscription_buffer,
                    config.verify_events,
                )),
                backoff: Mutex::new(ExponentialBackoff::from_config(&config)),
                url,
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
                pending_acks: Mutex::new(AckTable::default()),
                notifications,
                tasks: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Listen for connect, disconnect and `NOTICE` events.
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.shared.notifications.subscribe()
    }

    /// Publishers currently waiting for `OK`.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending_acks.lock().len()
    }

    /// Reconnect delays handed out since the relay last answered.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.backoff.lock().attempt()
    }

    /// Ids of subscriptions open on this connection.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.shared.router.active_ids()
    }

    /// Open the WebSocket and start the reader and writer tasks.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        install_crypto_provider();
        info!("Connecting to relay: {}", shared.url);

        let started = Instant::now();
        let ws = match timeout(
            shared.config.connect_timeout,
            connect_async(shared.url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                *shared.state.lock() = ConnectionState::Disconnected;
                return Err(ClientError::Connection(format!("{}: {}", shared.url, e)));
            }
            Err(_) => {
                *shared.state.lock() = ConnectionState::Disconnected;
                return Err(ClientError::Connection(format!(
                    "{}: handshake timed out after {:?}",
                    shared.url, shared.config.connect_timeout
                )));
            }
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(shared.config.outbound_buffer.max(1));
        let generation = {
            let mut state = shared.state.lock();
            if *state != ConnectionState::Connecting {
                return Err(ClientError::Connection(format!(
                    "{}: connect interrupted by disconnect",
                    shared.url
                )));
            }
            *state = ConnectionState::Connected;
            *shared.outbound.lock() = Some(tx);
            shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        // The reader's teardown takes `tasks`, so they are stored before it can run.
        {
            let mut tasks = shared.tasks.lock();
            if !shared.is_current(generation) {
                // Dropping both halves closes the socket.
                return Err(ClientError::Connection(format!(
                    "{}: connect interrupted by disconnect",
                    shared.url
                )));
            }
            info!("Connected to relay: {} (took {:?})", shared.url, started.elapsed());
            shared.notify(RelayNotification::Connected {
                relay_url: shared.url.to_string(),
            });
            let writer = tokio::spawn(write_loop(sink, rx, shared.url.clone()));
            let reader = tokio::spawn(read_loop(stream, Arc::clone(shared), generation));
            *tasks = Some(ConnectionTasks { reader, writer });
        }

        Ok(())
    }

    /// Close the WebSocket gracefully.
    ///
    /// Pending publishes fail with `ConnectionLost` and open subscriptions
    /// close with [`CloseReason::ConnectionLost`].
    pub async fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Closing
            ) {
                return Ok(());
            }
            *state = ConnectionState::Closing;
            shared.generation.fetch_add(1, Ordering::SeqCst);
        }

        info!("Disconnecting from relay: {}", shared.url);
        let (acks, subscriptions) = shared.teardown();
        if acks > 0 || subscriptions > 0 {
            debug!(
                "Disconnect from {} abandoned {} pending acks and {} subscriptions",
                shared.url, acks, subscriptions
            );
        }

        let tasks = shared.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            if timeout(CLOSE_GRACE, &mut tasks.writer).await.is_err() {
                debug!("Writer for {} did not finish in time", shared.url);
                tasks.writer.abort();
            }
            tasks.reader.abort();
        }

        *shared.state.lock() = ConnectionState::Disconnected;
        shared.notify(RelayNotification::Disconnected {
            relay_url: shared.url.to_string(),
            unexpected: false,
        });
        info!("Disconnected from relay: {}", shared.url);

        Ok(())
    }

    /// Tear the connection down without waiting for the close handshake.
    pub(crate) fn close_now(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
            shared.generation.fetch_add(1, Ordering::SeqCst);
        }

        shared.teardown();
        if let Some(tasks) = shared.tasks.lock().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
        debug!("Closed connection to {}", shared.url);
    }

    /// Drop the current transport (if any) and connect again.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }

    /// Attempt reconnection with exponential backoff
    ///
    /// Returns the delay that was waited before attempting reconnection,
    /// or None if max attempts exhausted.
    pub async fn reconnect_with_backoff(&self) -> Result<Option<Duration>> {
        if self.is_connected() {
            return Ok(Some(Duration::ZERO));
        }

        let delay = self.shared.backoff.lock().next_delay();
        let Some(wait_duration) = delay else {
            warn!("Max reconnection attempts exhausted for {}", self.shared.url);
            return Ok(None);
        };

        info!(
            "Waiting {:?} before reconnecting to {}",
            wait_duration, self.shared.url
        );
        tokio::time::sleep(wait_duration).await;

        match self.connect().await {
            Ok(()) => {
                info!("Successfully reconnected to {}", self.shared.url);
                Ok(Some(wait_duration))
            }
            Err(e) => {
                warn!("Reconnection attempt failed for {}: {}", self.shared.url, e);
                Err(e)
            }
        }
    }

    /// Retry [`reconnect_with_backoff`](Self::reconnect_with_backoff) until it
    /// connects or the attempts run out.
    pub async fn reconnect_until_connected(&self) -> Result<()> {
        loop {
            match self.reconnect_with_backoff().await {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {
                    return Err(ClientError::Connection(format!(
                        "{}: reconnect attempts exhausted",
                        self.shared.url
                    )));
                }
                Err(ClientError::AlreadyConnected) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    fn outbound(&self) -> Result<mpsc::Sender<String>> {
        self.shared
            .outbound
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Queue one frame. Returns once queued, not when the relay reacts.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_json()?;
        self.outbound()?
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Publish an event and wait for the relay's `OK`.
    ///
    /// `OK false` becomes [`ClientError::Rejected`]; no answer within
    /// `ack_timeout` becomes [`ClientError::AckTimeout`].
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let ack_timeout = self.shared.config.ack_timeout;
        let (token, rx) = self.shared.pending_acks.lock().register(&event.id);
        let _guard = AckGuard {
            table: &self.shared.pending_acks,
            event_id: &event.id,
            token,
        };

        self.send(&ClientMessage::Event(event.clone())).await?;

        match timeout(ack_timeout, rx).await {
            Ok(Ok(outcome)) if outcome.accepted => Ok(PublishConfirmation {
                relay_url: self.shared.url.to_string(),
                event_id: event.id.clone(),
                message: outcome.message,
            }),
            Ok(Ok(outcome)) => Err(ClientError::Rejected(outcome.message)),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::AckTimeout(ack_timeout)),
        }
    }

    /// Open a live subscription with a generated id.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.subscribe_with_id(None, filters, SubscriptionMode::Live)
            .await
    }

    /// Open a subscription that ends at `EOSE`.
    pub async fn fetch(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.subscribe_with_id(None, filters, SubscriptionMode::UntilEose)
            .await
    }

    /// Register a subscription, then send its `REQ`.
    ///
    /// A caller-chosen id already open on this connection fails with
    /// [`ClientError::DuplicateSubscription`].
    pub async fn subscribe_with_id(
        &self,
        id: Option<String>,
        filters: Vec<Filter>,
        mode: SubscriptionMode,
    ) -> Result<Subscription> {
        let outbound = self.outbound()?;
        let subscription = self
            .shared
            .router
            .open(id, filters, mode, outbound.clone())?;

        let frame = ClientMessage::Req {
            subscription_id: subscription.id().to_string(),
            filters: subscription.filters().to_vec(),
        }
        .to_json()?;
        debug!(
            "Opening subscription {} on {}",
            subscription.id(),
            self.shared.url
        );
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionLost)?;

        Ok(subscription)
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.shared.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}
