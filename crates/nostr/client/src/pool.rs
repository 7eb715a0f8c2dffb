//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool is the session façade: it publishes to every relay and reports
//! each relay's answer, and it merges subscriptions across relays into one
//! de-duplicated stream.
//!
//! Each relay's share of a pool subscription (a "leg") is an ordinary
//! [`Subscription`] on that relay's connection. A forwarder task per leg
//! moves events into the pool subscription's queue and records `EOSE` in a
//! [`SubscriptionTracker`].

use crate::config::SessionConfig;
use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::{ConnectionState, PublishConfirmation, RelayConnection, RelayNotification, parse_relay_url};
use crate::subscription::{
    CloseReason, DeliveryQueue, Next, Subscription, SubscriptionItem, SubscriptionMode,
    SubscriptionRef, SubscriptionState, SubscriptionTracker, end_of_stream,
    generate_subscription_id,
};
use futures::Stream;
use futures::future::join_all;
use lru::LruCache;
use nostr::{
    Event, EventTemplate, KIND_SHORT_TEXT_NOTE, deletion_template, reaction_template,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Event ids remembered per pool subscription, per slot of its delivery queue.
const SEEN_IDS_PER_SLOT: usize = 4;

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
}

/// Per-relay outcome of one publish.
#[derive(Debug)]
pub struct PublishReport {
    event_id: String,
    outcomes: Vec<(String, Result<PublishConfirmation>)>,
}

impl PublishReport {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// At least one relay accepted the event.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_ok())
    }

    /// Every relay's result, ordered by relay URL.
    pub fn outcomes(&self) -> &[(String, Result<PublishConfirmation>)] {
        &self.outcomes
    }

    pub fn accepted(&self) -> Vec<&PublishConfirmation> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| outcome.as_ref().ok())
            .collect()
    }

    /// Relays that refused, timed out or were unreachable.
    pub fn rejected(&self) -> Vec<(&str, &ClientError)> {
        self.outcomes
            .iter()
            .filter_map(|(url, outcome)| outcome.as_ref().err().map(|e| (url.as_str(), e)))
            .collect()
    }
}

/// Shared state of one pool subscription.
struct MergedSubscription {
    id: String,
    filters: Vec<Filter>,
    mode: SubscriptionMode,
    queue: DeliveryQueue,
    /// Recently delivered ids; a duplicate older than this window is delivered again.
    seen: Mutex<LruCache<String, ()>>,
    tracker: Mutex<SubscriptionTracker>,
    legs: Mutex<HashMap<String, SubscriptionRef>>,
    all_eose_sent: AtomicBool,
    /// Survive losing every leg, waiting for a reconnect to re-attach one.
    await_reconnect: bool,
}

impl MergedSubscription {
    fn deliver(&self, event: Event) {
        if self.seen.lock().put(event.id.clone(), ()).is_none() {
            self.queue.push(SubscriptionItem::Event(event));
        }
    }

    fn relay_eose(&self, relay_url: &str, events: &broadcast::Sender<PoolEvent>) {
        self.tracker.lock().mark_eose(relay_url);
        let _ = events.send(PoolEvent::Eose {
            relay_url: relay_url.to_string(),
            subscription_id: self.id.clone(),
        });
        self.check_all_eose(events);
    }

    fn check_all_eose(&self, events: &broadcast::Sender<PoolEvent>) {
        if !self.tracker.lock().all_eose || self.all_eose_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("All relays sent EOSE for {}", self.id);
        let _ = events.send(PoolEvent::AllEose {
            subscription_id: self.id.clone(),
        });
        match self.mode {
            SubscriptionMode::Live => {
                self.queue.push(SubscriptionItem::EndOfStoredEvents);
            }
            SubscriptionMode::UntilEose => {
                self.queue.close(CloseReason::EndOfStoredEvents);
            }
        }
    }

    fn leg_finished(
        &self,
        relay_url: &str,
        leg: &SubscriptionRef,
        reason: CloseReason,
        events: &broadcast::Sender<PoolEvent>,
    ) {
        {
            let mut legs = self.legs.lock();
            match legs.get(relay_url) {
                Some(current) if current.same_subscription(leg) => {
                    legs.remove(relay_url);
                }
                // Already replaced by a leg on a fresh connection.
                Some(_) => return,
                None => {}
            }
        }

        match &reason {
            CloseReason::ClosedByCaller => return,
            CloseReason::EndOfStoredEvents => self.relay_eose(relay_url, events),
            CloseReason::ClosedByRelay(_) | CloseReason::ConnectionLost => {
                debug!("Leg {} of {} ended: {:?}", relay_url, self.id, reason);
                self.tracker.lock().remove_relay(relay_url);
                self.check_all_eose(events);
            }
        }

        if !self.legs.lock().is_empty() || self.queue.is_closed() {
            return;
        }
        if reason == CloseReason::ConnectionLost && self.await_reconnect {
            debug!("Subscription {} has no relays left; waiting for reconnect", self.id);
            return;
        }
        self.queue.close(reason);
    }

    /// Stop delivery; returns the legs still to be closed if this call did it.
    fn begin_close(self: &Arc<Self>, pool: &Weak<PoolInner>) -> Option<Vec<SubscriptionRef>> {
        if let Some(inner) = pool.upgrade() {
            let mut subscriptions = inner.subscriptions.lock();
            if subscriptions
                .get(&self.id)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                subscriptions.remove(&self.id);
            }
        }
        if !self.queue.close(CloseReason::ClosedByCaller) {
            return None;
        }
        Some(self.legs.lock().drain().map(|(_, leg)| leg).collect())
    }
}

async fn forward_leg(
    merged: Arc<MergedSubscription>,
    relay_url: String,
    mut leg: Subscription,
    events: broadcast::Sender<PoolEvent>,
) {
    let handle = leg.handle();
    loop {
        match leg.next_item().await {
            Ok(Some(SubscriptionItem::Event(event))) => merged.deliver(event),
            Ok(Some(SubscriptionItem::EndOfStoredEvents)) => merged.relay_eose(&relay_url, &events),
            Ok(None) | Err(_) => break,
        }
    }

    let reason = match leg.state() {
        SubscriptionState::Closed(reason) => reason,
        _ => CloseReason::ConnectionLost,
    };
    merged.leg_finished(&relay_url, &handle, reason, &events);
}

/// A subscription merged across every relay in the pool.
///
/// Events arrive de-duplicated by id. Dropping the handle closes every leg.
pub struct PoolSubscription {
    shared: Arc<MergedSubscription>,
    pool: Weak<PoolInner>,
}

impl PoolSubscription {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.shared.filters
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.shared.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.queue.state()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.queue.dropped()
    }

    /// Relays currently carrying this subscription.
    pub fn relays(&self) -> Vec<String> {
        let mut relays: Vec<String> = self.shared.legs.lock().keys().cloned().collect();
        relays.sort();
        relays
    }

    /// Same contract as [`Subscription::next`].
    pub async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            match self.shared.queue.next().await {
                Next::Item(SubscriptionItem::Event(event)) => return Ok(Some(event)),
                Next::Item(SubscriptionItem::EndOfStoredEvents) => continue,
                Next::Closed(reason) => return end_of_stream(&self.shared.id, reason),
            }
        }
    }

    /// Close every leg. Closing twice is a no-op.
    pub async fn close(&self) {
        if let Some(legs) = self.shared.begin_close(&self.pool) {
            join_all(legs.iter().map(SubscriptionRef::close)).await;
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(subscription))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        if let Some(legs) = self.shared.begin_close(&self.pool) {
            for leg in legs {
                leg.close_now();
            }
        }
    }
}

fn seen_capacity(subscription_buffer: usize) -> NonZeroUsize {
    NonZeroUsize::new(subscription_buffer.saturating_mul(SEEN_IDS_PER_SLOT))
        .unwrap_or(NonZeroUsize::MIN)
}

struct RelayEntry {
    connection: RelayConnection,
    watcher: JoinHandle<()>,
    reconnect: Option<JoinHandle<()>>,
    /// Set by `connect_relay`, cleared by a local disconnect. Auto-reconnect
    /// only runs while set.
    wanted: bool,
}

impl RelayEntry {
    fn stop_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

struct PoolInner {
    config: SessionConfig,
    /// Keyed by normalized relay URL
    relays: Mutex<BTreeMap<String, RelayEntry>>,
    subscriptions: Mutex<HashMap<String, Arc<MergedSubscription>>>,
    events_tx: broadcast::Sender<PoolEvent>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for entry in self.relays.get_mut().values_mut() {
            entry.watcher.abort();
            entry.stop_reconnect();
            entry.connection.close_now();
        }
    }
}

/// A pool of Nostr relay connections.
///
/// Clones share one pool. Dropping the last handle closes every connection.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create a pool for the configured relays. Nothing connects yet.
    pub fn new(config: SessionConfig) -> Result<Self> {
        for url in &config.relays {
            parse_relay_url(url)?;
        }
        let (events_tx, _) = broadcast::channel(1000);

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                relays: Mutex::new(BTreeMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                events_tx,
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to pool events.
    pub fn notifications(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events_tx.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Get all relay URLs in the pool.
    pub fn relay_urls(&self) -> Vec<String> {
        self.inner.relays.lock().keys().cloned().collect()
    }

    /// Get connection states for all relays.
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.inner
            .relays
            .lock()
            .iter()
            .map(|(url, entry)| (url.clone(), entry.connection.state()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .relays
            .lock()
            .values()
            .filter(|entry| entry.connection.is_connected())
            .count()
    }

    pub fn connection(&self, url: &str) -> Option<RelayConnection> {
        let key = parse_relay_url(url).ok()?.to_string();
        self.inner
            .relays
            .lock()
            .get(&key)
            .map(|entry| entry.connection.clone())
    }

    fn connections(&self) -> Vec<(String, RelayConnection)> {
        self.inner
            .relays
            .lock()
            .iter()
            .map(|(url, entry)| (url.clone(), entry.connection.clone()))
            .collect()
    }

    /// Add a relay to the pool without connecting. Returns its normalized URL.
    pub async fn add_relay(&self, url: &str) -> Result<String> {
        let key = parse_relay_url(url)?.to_string();
        let mut relays = self.inner.relays.lock();
        if relays.contains_key(&key) {
            return Ok(key);
        }

        info!("Adding relay to pool: {}", key);
        let connection = RelayConnection::new(&key, self.inner.config.relay.clone())?;
        let watcher = tokio::spawn(watch_relay(
            Arc::downgrade(&self.inner),
            connection.notifications(),
        ));
        relays.insert(
            key.clone(),
            RelayEntry {
                connection,
                watcher,
                reconnect: None,
                wanted: false,
            },
        );
        Ok(key)
    }

    /// Remove a relay from the pool, closing its connection.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let key = parse_relay_url(url)?.to_string();
        let Some(mut entry) = self.inner.relays.lock().remove(&key) else {
            return Ok(false);
        };

        info!("Removing relay from pool: {}", key);
        entry.watcher.abort();
        entry.stop_reconnect();
        let was_connected = entry.connection.is_connected();
        entry.connection.disconnect().await?;
        if was_connected {
            self.emit(PoolEvent::Disconnected { relay_url: key });
        }
        Ok(true)
    }

    /// Connect to a specific relay, adding it if needed, and attach live
    /// pool subscriptions to it.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let key = self.add_relay(url).await?;
        let connection = {
            let mut relays = self.inner.relays.lock();
            let Some(entry) = relays.get_mut(&key) else {
                return Err(ClientError::NotConnected);
            };
            entry.wanted = true;
            entry.connection.clone()
        };

        match connection.connect().await {
            Ok(()) => {}
            Err(ClientError::AlreadyConnected) if connection.is_connected() => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.inner.config.resubscribe_on_reconnect {
            self.resubscribe(&key, &connection).await;
        }
        Ok(())
    }

    /// Connect every configured relay concurrently.
    pub async fn connect(&self) -> Vec<(String, Result<()>)> {
        let mut urls = Vec::new();
        for url in &self.inner.config.relays {
            match self.add_relay(url).await {
                Ok(key) => urls.push(key),
                Err(e) => warn!("Skipping relay {}: {}", url, e),
            }
        }
        for url in self.relay_urls() {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        let results = join_all(urls.iter().map(|url| self.connect_relay(url))).await;
        let results: Vec<(String, Result<()>)> = urls.into_iter().zip(results).collect();

        let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!("Connected to {}/{} relays", connected, results.len());
        results
    }

    /// Disconnect from all relays and cancel pending reconnects. Open pool
    /// subscriptions end with [`CloseReason::ConnectionLost`].
    pub async fn disconnect_all(&self) {
        let connections: Vec<(String, RelayConnection)> = self
            .inner
            .relays
            .lock()
            .iter_mut()
            .map(|(url, entry)| {
                entry.wanted = false;
                entry.stop_reconnect();
                (url.clone(), entry.connection.clone())
            })
            .collect();
        join_all(connections.iter().map(|(url, connection)| async move {
            if let Err(e) = connection.disconnect().await {
                warn!("Error disconnecting from {}: {}", url, e);
            }
        }))
        .await;

        let subscriptions: Vec<Arc<MergedSubscription>> =
            self.inner.subscriptions.lock().drain().map(|(_, merged)| merged).collect();
        for merged in subscriptions {
            merged.queue.close(CloseReason::ConnectionLost);
        }
    }

    /// Publish to every relay concurrently and report each answer.
    pub async fn publish(&self, event: &Event) -> PublishReport {
        let connections = self.connections();
        let results = join_all(
            connections
                .iter()
                .map(|(_, connection)| connection.publish(event)),
        )
        .await;

        let outcomes: Vec<(String, Result<PublishConfirmation>)> = connections
            .into_iter()
            .map(|(url, _)| url)
            .zip(results)
            .collect();
        let report = PublishReport {
            event_id: event.id.clone(),
            outcomes,
        };

        info!(
            "Published {} (kind {}): {}/{} relays accepted",
            event.id,
            event.kind,
            report.accepted().len(),
            report.outcomes().len()
        );
        for (url, error) in report.rejected() {
            warn!("Relay {} did not accept {}: {}", url, event.id, error);
        }
        report
    }

    /// Sign a template with the session key.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event> {
        Ok(self.inner.config.require_keys()?.sign(template)?)
    }

    /// Publish a kind-1 text note.
    pub async fn publish_note(&self, content: &str, tags: Vec<Vec<String>>) -> Result<PublishReport> {
        let event = self.sign(&EventTemplate::now(KIND_SHORT_TEXT_NOTE, tags, content))?;
        Ok(self.publish(&event).await)
    }

    /// React to an event (NIP-25). `author` adds a `p` tag for the reacted-to author.
    pub async fn react(
        &self,
        event_id: &str,
        author: Option<&str>,
        reaction: &str,
    ) -> Result<PublishReport> {
        let event = self.sign(&reaction_template(event_id, author, reaction))?;
        Ok(self.publish(&event).await)
    }

    /// Request deletion of one of our events (NIP-09).
    ///
    /// Deletion is advisory: an accepting relay may still serve the event,
    /// and other relays never hear about it.
    pub async fn delete(&self, event_id: &str, reason: Option<&str>) -> Result<PublishReport> {
        let event = self.sign(&deletion_template([event_id], reason))?;
        info!(
            "Requesting deletion of {}; relays are not obliged to honor it",
            event_id
        );
        Ok(self.publish(&event).await)
    }

    /// Withdraw a reaction by requesting deletion of the reaction event.
    pub async fn undo_reaction(&self, reaction_event_id: &str) -> Result<PublishReport> {
        self.delete(reaction_event_id, None).await
    }

    /// Open a live subscription on every connected relay.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<PoolSubscription> {
        self.open(filters, SubscriptionMode::Live).await
    }

    /// Open a subscription that ends once every relay has sent `EOSE`.
    pub async fn fetch(&self, filters: Vec<Filter>) -> Result<PoolSubscription> {
        self.open(filters, SubscriptionMode::UntilEose).await
    }

    /// Fetch stored events, giving up on slow relays after `wait`.
    pub async fn query(&self, filters: Vec<Filter>, wait: Duration) -> Result<Vec<Event>> {
        let mut subscription = self.fetch(filters).await?;
        let deadline = Instant::now() + wait;
        let mut events = Vec::new();

        loop {
            match timeout_at(deadline, subscription.next()).await {
                Ok(Ok(Some(event))) => events.push(event),
                Ok(Ok(None)) => break,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        "Query {} timed out after {:?} with {} events",
                        subscription.id(),
                        wait,
                        events.len()
                    );
                    break;
                }
            }
        }

        subscription.close().await;
        Ok(events)
    }

    /// Close a pool subscription on every relay. Closing twice is a no-op.
    pub async fn unsubscribe(&self, subscription: &PoolSubscription) {
        subscription.close().await;
    }

    async fn open(&self, filters: Vec<Filter>, mode: SubscriptionMode) -> Result<PoolSubscription> {
        if filters.is_empty() {
            return Err(ClientError::InvalidRequest(
                "a subscription needs at least one filter".to_string(),
            ));
        }
        let connections: Vec<(String, RelayConnection)> = self
            .connections()
            .into_iter()
            .filter(|(_, connection)| connection.is_connected())
            .collect();
        if connections.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let config = &self.inner.config;
        let merged = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let id = loop {
                let candidate = generate_subscription_id();
                if !subscriptions.contains_key(&candidate) {
                    break candidate;
                }
            };
            let merged = Arc::new(MergedSubscription {
                queue: DeliveryQueue::new(id.clone(), config.relay.subscription_buffer),
                tracker: Mutex::new(SubscriptionTracker::new(id.clone(), filters.clone())),
                id: id.clone(),
                filters,
                mode,
                seen: Mutex::new(LruCache::new(seen_capacity(
                    config.relay.subscription_buffer,
                ))),
                legs: Mutex::new(HashMap::new()),
                all_eose_sent: AtomicBool::new(false),
                await_reconnect: mode == SubscriptionMode::Live
                    && config.auto_reconnect
                    && config.resubscribe_on_reconnect,
            });
            subscriptions.insert(id, Arc::clone(&merged));
            merged
        };
        let subscription = PoolSubscription {
            shared: Arc::clone(&merged),
            pool: Arc::downgrade(&self.inner),
        };

        // Every target relay counts toward EOSE before any REQ goes out.
        {
            let mut tracker = merged.tracker.lock();
            for (url, _) in &connections {
                tracker.add_relay(url.as_str());
            }
        }

        let results = join_all(
            connections
                .iter()
                .map(|(url, connection)| self.attach_leg(&merged, url, connection)),
        )
        .await;

        let mut attached = 0;
        let mut last_error = None;
        for ((url, _), result) in connections.iter().zip(results) {
            match result {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!("Failed to open {} on {}: {}", merged.id, url, e);
                    last_error = Some(e);
                }
            }
        }
        if attached == 0 {
            return Err(last_error.unwrap_or(ClientError::NotConnected));
        }

        info!(
            "Subscription {} open on {}/{} relays",
            merged.id,
            attached,
            connections.len()
        );
        Ok(subscription)
    }

    async fn attach_leg(
        &self,
        merged: &Arc<MergedSubscription>,
        relay_url: &str,
        connection: &RelayConnection,
    ) -> Result<()> {
        merged.tracker.lock().add_relay(relay_url);
        let leg = match connection
            .subscribe_with_id(Some(merged.id.clone()), merged.filters.clone(), merged.mode)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                merged.tracker.lock().remove_relay(relay_url);
                merged.check_all_eose(&self.inner.events_tx);
                return Err(e);
            }
        };
        let handle = leg.handle();

        merged.legs.lock().insert(relay_url.to_string(), handle.clone());
        tokio::spawn(forward_leg(
            Arc::clone(merged),
            relay_url.to_string(),
            leg,
            self.inner.events_tx.clone(),
        ));

        // Closed while we were attaching.
        if merged.queue.is_closed() {
            handle.close().await;
        }
        Ok(())
    }

    /// Re-issue live pool subscriptions that have no leg on `relay_url`.
    async fn resubscribe(&self, relay_url: &str, connection: &RelayConnection) {
        let pending: Vec<Arc<MergedSubscription>> = self
            .inner
            .subscriptions
            .lock()
            .values()
            .filter(|merged| {
                merged.mode == SubscriptionMode::Live
                    && !merged.queue.is_closed()
                    && merged
                        .legs
                        .lock()
                        .get(relay_url)
                        .is_none_or(SubscriptionRef::is_closed)
            })
            .cloned()
            .collect();

        for merged in pending {
            match self.attach_leg(&merged, relay_url, connection).await {
                Ok(()) => info!("Resubscribed {} on {}", merged.id, relay_url),
                Err(e) => warn!("Failed to resubscribe {} on {}: {}", merged.id, relay_url, e),
            }
        }
    }

    /// Close subscriptions left waiting for a reconnect that will not come.
    fn fail_orphaned_subscriptions(&self) {
        let subscriptions: Vec<Arc<MergedSubscription>> =
            self.inner.subscriptions.lock().values().cloned().collect();
        for merged in subscriptions {
            if merged.legs.lock().is_empty() && merged.queue.close(CloseReason::ConnectionLost) {
                warn!("Subscription {} lost every relay", merged.id);
            }
        }
    }

    fn is_wanted(&self, relay_url: &str) -> bool {
        self.inner
            .relays
            .lock()
            .get(relay_url)
            .is_some_and(|entry| entry.wanted)
    }

    /// Start reconnecting `relay_url` in the background. The task is owned by
    /// the relay's entry so a local disconnect or removal cancels it.
    fn spawn_reconnect(&self, relay_url: String) {
        let mut relays = self.inner.relays.lock();
        let Some(entry) = relays.get_mut(&relay_url) else {
            return;
        };
        if !entry.wanted {
            debug!("Not reconnecting {}: disconnected locally", relay_url);
            return;
        }
        let connection = entry.connection.clone();
        let pool = Arc::downgrade(&self.inner);

        entry.stop_reconnect();
        entry.reconnect = Some(tokio::spawn(async move {
            let result = connection.reconnect_until_connected().await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let pool = RelayPool { inner };
            match result {
                Ok(()) if !pool.is_wanted(&relay_url) => {
                    debug!("Dropping reconnect to {}: disconnected locally", relay_url);
                    let _ = connection.disconnect().await;
                }
                Ok(()) if pool.inner.config.resubscribe_on_reconnect => {
                    pool.resubscribe(&relay_url, &connection).await;
                }
                Ok(()) => {}
                Err(e) => {
                    warn!("Giving up on relay {}: {}", relay_url, e);
                    pool.fail_orphaned_subscriptions();
                }
            }
        }));
    }
}

/// Forward one relay's notifications into pool events, reconnecting after
/// unexpected drops when configured to.
async fn watch_relay(pool: Weak<PoolInner>, mut notifications: broadcast::Receiver<RelayNotification>) {
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Pool missed {} relay notifications", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let pool = RelayPool { inner };

        match notification {
            RelayNotification::Connected { relay_url } => {
                pool.emit(PoolEvent::Connected { relay_url });
            }
            RelayNotification::Notice { relay_url, message } => {
                pool.emit(PoolEvent::Notice { relay_url, message });
            }
            RelayNotification::Disconnected {
                relay_url,
                unexpected,
            } => {
                pool.emit(PoolEvent::Disconnected {
                    relay_url: relay_url.clone(),
                });
                if unexpected && pool.inner.config.auto_reconnect {
                    pool.spawn_reconnect(relay_url);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    fn pool(relays: &[&str]) -> RelayPool {
        RelayPool::new(SessionConfig::new(relays.iter().copied())).unwrap()
    }

    #[test]
    fn test_new_validates_urls() {
        assert!(matches!(
            RelayPool::new(SessionConfig::new(["https://example.com"])),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_relay() {
        let pool = pool(&[]);
        let key = pool.add_relay("wss://relay.example.com").await.unwrap();
        assert_eq!(key, "wss://relay.example.com/");
        assert_eq!(pool.add_relay("wss://relay.example.com/").await.unwrap(), key);
        assert_eq!(pool.relay_urls(), vec![key.clone()]);
        assert_eq!(
            pool.states(),
            vec![(key.clone(), ConnectionState::Disconnected)]
        );

        assert!(pool.remove_relay("wss://relay.example.com").await.unwrap());
        assert!(!pool.remove_relay(&key).await.unwrap());
        assert!(pool.relay_urls().is_empty());
    }

    #[tokio::test]
    async fn test_sign_requires_keys() {
        let pool = pool(&["wss://relay.example.com"]);
        let result = pool.sign(&EventTemplate::now(1, vec![], "x"));
        assert!(matches!(result, Err(ClientError::Config(_))));
        assert!(matches!(
            pool.publish_note("x", vec![]).await,
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_without_connections() {
        let keys = Keys::generate();
        let pool = RelayPool::new(
            SessionConfig::new(["wss://relay.example.com"]).with_keys(keys),
        )
        .unwrap();
        pool.add_relay("wss://relay.example.com").await.unwrap();

        let report = pool.publish_note("hello", vec![]).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.outcomes().len(), 1);
        assert!(matches!(report.rejected()[0].1, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_subscribe_without_connections() {
        let pool = pool(&[]);
        assert!(matches!(
            pool.subscribe(vec![Filter::new()]).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            pool.fetch(vec![]).await,
            Err(ClientError::InvalidRequest(_))
        ));
    }

    fn merged(buffer: usize) -> MergedSubscription {
        MergedSubscription {
            id: "feed".to_string(),
            filters: vec![Filter::new()],
            mode: SubscriptionMode::Live,
            queue: DeliveryQueue::new("feed", buffer),
            seen: Mutex::new(LruCache::new(seen_capacity(buffer))),
            tracker: Mutex::new(SubscriptionTracker::new("feed", vec![Filter::new()])),
            legs: Mutex::new(HashMap::new()),
            all_eose_sent: AtomicBool::new(false),
            await_reconnect: false,
        }
    }

    #[tokio::test]
    async fn test_duplicates_delivered_once() {
        let merged = merged(16);
        let keys = Keys::generate();
        let event = keys.sign(&EventTemplate::now(1, vec![], "twice")).unwrap();

        merged.deliver(event.clone());
        merged.deliver(event.clone());
        merged.queue.close(CloseReason::EndOfStoredEvents);

        assert!(matches!(
            merged.queue.next().await,
            Next::Item(SubscriptionItem::Event(received)) if received == event
        ));
        assert!(matches!(merged.queue.next().await, Next::Closed(_)));
    }

    #[test]
    fn test_seen_ids_are_bounded() {
        let merged = merged(2);
        let keys = Keys::generate();
        let first = keys.sign(&EventTemplate::now(1, vec![], "first")).unwrap();
        merged.deliver(first.clone());

        for i in 0..20 {
            let event = keys
                .sign(&EventTemplate::now(1, vec![], format!("n{}", i)))
                .unwrap();
            merged.deliver(event);
        }

        let seen = merged.seen.lock();
        assert_eq!(seen.len(), 2 * SEEN_IDS_PER_SLOT);
        assert!(!seen.contains(&first.id));
    }

    #[test]
    fn test_publish_report_breakdown() {
        let report = PublishReport {
            event_id: "e1".to_string(),
            outcomes: vec![
                (
                    "wss://a/".to_string(),
                    Ok(PublishConfirmation {
                        relay_url: "wss://a/".to_string(),
                        event_id: "e1".to_string(),
                        message: String::new(),
                    }),
                ),
                (
                    "wss://b/".to_string(),
                    Err(ClientError::Rejected("blocked".to_string())),
                ),
            ],
        };

        assert!(report.is_success());
        assert_eq!(report.accepted().len(), 1);
        assert_eq!(report.rejected()[0].0, "wss://b/");
    }
}
