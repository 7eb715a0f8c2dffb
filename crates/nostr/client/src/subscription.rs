//! Subscription routing for a single relay connection.
//!
//! Many logical subscriptions share one transport. The receive loop hands
//! every `EVENT`, `EOSE` and `CLOSED` frame to the [`SubscriptionRouter`],
//! which correlates it by subscription id and pushes it into that
//! subscription's bounded queue. Callers drain the queue through a
//! [`Subscription`] handle.
//!
//! Queues drop their oldest entry when full, so a slow consumer never stalls
//! the receive loop; [`Subscription::dropped`] reports how many were lost.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use futures::Stream;
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest subscription id relays are required to accept.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// When a subscription ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Stored events, then live events until closed.
    Live,
    /// Stored events only; closed (and `CLOSE` sent) at `EOSE`.
    UntilEose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClosedByCaller,
    ClosedByRelay(String),
    EndOfStoredEvents,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// REQ sent, nothing received yet
    Pending,
    /// At least one event or EOSE received
    Active,
    Closed(CloseReason),
}

/// One entry of a subscription queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(Event),
    /// The relay finished sending stored events (live subscriptions only).
    EndOfStoredEvents,
}

pub(crate) enum Next {
    Item(SubscriptionItem),
    Closed(CloseReason),
}

/// Map a terminal reason onto what iteration returns.
pub(crate) fn end_of_stream<T>(id: &str, reason: CloseReason) -> Result<Option<T>> {
    match reason {
        CloseReason::ClosedByCaller => Err(ClientError::SubscriptionClosed(id.to_string())),
        CloseReason::ConnectionLost => Err(ClientError::ConnectionLost),
        CloseReason::ClosedByRelay(_) | CloseReason::EndOfStoredEvents => Ok(None),
    }
}

struct QueueInner {
    items: VecDeque<SubscriptionItem>,
    state: SubscriptionState,
    dropped: u64,
}

/// Bounded drop-oldest queue with a single consumer.
pub(crate) struct DeliveryQueue {
    label: String,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DeliveryQueue {
    pub(crate) fn new(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            label: label.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                state: SubscriptionState::Pending,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns false if the queue is already closed.
    pub(crate) fn push(&self, item: SubscriptionItem) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SubscriptionState::Closed(_)) {
            return false;
        }
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
            if inner.dropped == 1 || inner.dropped % 1000 == 0 {
                warn!(
                    "Subscription {} consumer is slow; dropped {} events so far",
                    self.label, inner.dropped
                );
            }
        }
        inner.items.push_back(item);
        inner.state = SubscriptionState::Active;
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Returns true if this call closed the queue.
    ///
    /// A caller close discards anything still queued; other reasons let the
    /// consumer drain first.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SubscriptionState::Closed(_)) {
            return false;
        }
        if reason == CloseReason::ClosedByCaller {
            inner.items.clear();
        }
        inner.state = SubscriptionState::Closed(reason);
        drop(inner);

        self.notify.notify_one();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, SubscriptionState::Closed(_))
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.inner.lock().state.clone()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub(crate) async fn next(&self) -> Next {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Next::Item(item);
                }
                if let SubscriptionState::Closed(reason) = &inner.state {
                    return Next::Closed(reason.clone());
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Router-side state of one subscription.
pub(crate) struct Slot {
    id: String,
    filters: Vec<Filter>,
    mode: SubscriptionMode,
    queue: DeliveryQueue,
}

impl Slot {
    fn accepts(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }
}

/// Correlates inbound frames with the subscriptions open on one connection.
pub struct SubscriptionRouter {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    capacity: usize,
    verify_events: bool,
}

impl SubscriptionRouter {
    pub fn new(capacity: usize, verify_events: bool) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity,
            verify_events,
        }
    }

    /// Register a subscription and return its handle. Nothing is sent; the
    /// caller issues the `REQ`.
    ///
    /// `id` of `None` picks a fresh id that is not in use on this connection.
    pub(crate) fn open(
        self: &Arc<Self>,
        id: Option<String>,
        filters: Vec<Filter>,
        mode: SubscriptionMode,
        outbound: mpsc::Sender<String>,
    ) -> Result<Subscription> {
        if filters.is_empty() {
            return Err(ClientError::InvalidRequest(
                "a subscription needs at least one filter".to_string(),
            ));
        }

        let mut slots = self.slots.lock();
        let id = match id {
            Some(id) => {
                if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LEN {
                    return Err(ClientError::InvalidRequest(format!(
                        "subscription id must be 1 to {} characters",
                        MAX_SUBSCRIPTION_ID_LEN
                    )));
                }
                if slots.contains_key(&id) {
                    return Err(ClientError::DuplicateSubscription(id));
                }
                id
            }
            None => loop {
                let candidate = generate_subscription_id();
                if !slots.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let slot = Arc::new(Slot {
            queue: DeliveryQueue::new(id.clone(), self.capacity),
            id: id.clone(),
            filters,
            mode,
        });
        slots.insert(id, Arc::clone(&slot));

        Ok(Subscription {
            handle: SubscriptionRef {
                slot,
                router: Arc::downgrade(self),
                outbound,
            },
        })
    }

    /// Deliver one subscription frame.
    ///
    /// Returns a frame to send back, if any (the `CLOSE` that ends an
    /// until-EOSE subscription). `OK` and `NOTICE` are not routed here.
    pub fn route(&self, message: RelayMessage) -> Option<ClientMessage> {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let Some(slot) = self.get(&subscription_id) else {
                    debug!("Dropping event {} for unknown subscription {}", event.id, subscription_id);
                    return None;
                };
                if !slot.accepts(&event) {
                    debug!("Dropping event {} not matching subscription {}", event.id, slot.id);
                    return None;
                }
                if self.verify_events && !event.verify() {
                    warn!("Dropping event {} with invalid id or signature", event.id);
                    return None;
                }
                slot.queue.push(SubscriptionItem::Event(event));
                None
            }
            RelayMessage::Eose { subscription_id } => {
                let slot = self.get(&subscription_id)?;
                match slot.mode {
                    SubscriptionMode::Live => {
                        slot.queue.push(SubscriptionItem::EndOfStoredEvents);
                        None
                    }
                    SubscriptionMode::UntilEose => {
                        self.remove_slot(&slot);
                        slot.queue.close(CloseReason::EndOfStoredEvents);
                        Some(ClientMessage::Close { subscription_id })
                    }
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let slot = self.get(&subscription_id)?;
                info!("Relay closed subscription {}: {}", subscription_id, message);
                self.remove_slot(&slot);
                slot.queue.close(CloseReason::ClosedByRelay(message));
                None
            }
            RelayMessage::Ok { .. } | RelayMessage::Notice { .. } => None,
        }
    }

    /// Close and forget every subscription.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            slot.queue.close(reason.clone());
        }
        slots.len()
    }

    /// Ids of subscriptions still open.
    pub fn active_ids(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn get(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots.lock().get(id).cloned()
    }

    /// Remove `slot` unless its id has since been reused by another slot.
    fn remove_slot(&self, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots.get(&slot.id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(&slot.id);
        }
    }
}

/// Clonable closer for a subscription, shared with the pool.
#[derive(Clone)]
pub(crate) struct SubscriptionRef {
    slot: Arc<Slot>,
    router: Weak<SubscriptionRouter>,
    outbound: mpsc::Sender<String>,
}

impl SubscriptionRef {
    /// Transition to closed; yields the `CLOSE` frame if this call did it.
    fn begin_close(&self) -> Option<String> {
        if !self.slot.queue.close(CloseReason::ClosedByCaller) {
            return None;
        }
        if let Some(router) = self.router.upgrade() {
            router.remove_slot(&self.slot);
        }
        ClientMessage::Close {
            subscription_id: self.slot.id.clone(),
        }
        .to_json()
        .ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slot.queue.is_closed()
    }

    pub(crate) fn same_subscription(&self, other: &SubscriptionRef) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Close without waiting for room on the outbound queue.
    pub(crate) fn close_now(&self) {
        if let Some(frame) = self.begin_close()
            && let Err(e) = self.outbound.try_send(frame)
        {
            debug!("CLOSE for {} not sent: {}", self.slot.id, e);
        }
    }

    pub(crate) async fn close(&self) {
        if let Some(frame) = self.begin_close()
            && self.outbound.send(frame).await.is_err()
        {
            debug!("CLOSE for {} not sent: connection gone", self.slot.id);
        }
    }
}

/// A lazy, cancellable sequence of events for one subscription.
///
/// Dropping the handle closes the subscription.
pub struct Subscription {
    handle: SubscriptionRef,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.handle.slot.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.handle.slot.filters
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.handle.slot.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.handle.slot.queue.state()
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.handle.slot.queue.dropped()
    }

    /// Next queued item, including end-of-stored-events markers.
    pub async fn next_item(&mut self) -> Result<Option<SubscriptionItem>> {
        match self.handle.slot.queue.next().await {
            Next::Item(item) => Ok(Some(item)),
            Next::Closed(reason) => end_of_stream(self.id(), reason),
        }
    }

    /// Next event.
    ///
    /// `Ok(None)` ends the sequence (EOSE in until-EOSE mode, or the relay
    /// closed it). Errors with `SubscriptionClosed` once the caller closed
    /// it and `ConnectionLost` if the transport dropped.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            match self.next_item().await? {
                Some(SubscriptionItem::Event(event)) => return Ok(Some(event)),
                Some(SubscriptionItem::EndOfStoredEvents) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Send `CLOSE` and stop delivery. Closing twice is a no-op.
    pub async fn close(&self) {
        self.handle.close().await;
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

    pub(crate) fn handle(&self) -> SubscriptionRef {
        self.handle.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.close_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for creating subscription filters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the subscription.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter for specific event kinds.
    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    /// Add a filter for events from specific authors.
    pub fn authors(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    /// Add a filter for specific event IDs.
    pub fn ids(self, ids: Vec<String>) -> Self {
        self.filter(Filter::new().ids(ids))
    }

    /// Add a filter for events of `kinds` by one author.
    pub fn authored(self, author: impl Into<String>, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().authors(vec![author.into()]).kinds(kinds))
    }

    /// Add a filter for events referencing `event_id` (replies, reactions, deletions).
    pub fn references(self, event_id: impl Into<String>) -> Self {
        self.filter(Filter::new().event_refs(vec![event_id.into()]))
    }

    pub fn build(self) -> Vec<Filter> {
        self.filters
    }
}

/// Tracks which relays carry a pool subscription and which have sent EOSE.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    pub id: String,
    pub filters: Vec<Filter>,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
    /// Every tracked relay has sent EOSE
    pub all_eose: bool,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            eose_relays: HashSet::new(),
            all_eose: false,
        }
    }

    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        let relay_url = relay_url.into();
        self.eose_relays.remove(&relay_url);
        self.relays.insert(relay_url);
        self.update_all_eose();
    }

    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Returns true when this call completed the set.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) -> bool {
        let relay_url = relay_url.into();
        if !self.relays.contains(&relay_url) {
            return false;
        }
        let was_complete = self.all_eose;
        self.eose_relays.insert(relay_url);
        self.update_all_eose();
        self.all_eose && !was_complete
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty() && self.relays.len() == self.eose_relays.len();
    }
}
