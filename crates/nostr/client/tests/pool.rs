//! Pool behaviour across several in-process relays.

mod common;

use common::{MockPeer, MockRelay, dead_url, note};
use nostr::{Keys, deleted_event_ids, is_deletion_request, reacted_event_id};
use nostr_client::{
    ClientError, ClientMessage, ConnectionState, Filter, PoolEvent, RelayConfig, RelayPool,
    SessionConfig, SubscriptionState,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn pool_of(relays: &[&MockRelay], keys: Keys) -> (RelayPool, Vec<MockPeer>) {
    let config = SessionConfig::new(relays.iter().map(|relay| relay.url().to_string()))
        .with_keys(keys);
    let pool = RelayPool::new(config).unwrap();

    let accept = futures::future::join_all(relays.iter().map(|relay| relay.accept()));
    let (results, peers) = tokio::join!(pool.connect(), accept);
    for (url, result) in results {
        assert!(result.is_ok(), "{} failed to connect: {:?}", url, result);
    }
    (pool, peers)
}

async fn wait_for(
    events: &mut broadcast::Receiver<PoolEvent>,
    wanted: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("pool event not seen")
}

#[tokio::test]
async fn test_publish_reports_each_relay() {
    let accepting = MockRelay::start().await;
    let refusing = MockRelay::start().await;
    let (pool, mut peers) = pool_of(&[&accepting, &refusing], Keys::generate()).await;
    let (first, second) = peers.split_at_mut(1);
    let (peer_ok, peer_no) = (&mut first[0], &mut second[0]);

    let serve = async {
        let event = peer_ok.recv_event().await;
        peer_ok.send_ok(&event.id, true, "").await;
        let event = peer_no.recv_event().await;
        peer_no.send_ok(&event.id, false, "blocked: not on allowlist").await;
    };
    let (report, ()) = tokio::join!(pool.publish_note("hello pool", vec![]), serve);
    let report = report.unwrap();

    assert!(report.is_success());
    assert_eq!(report.outcomes().len(), 2);
    assert_eq!(report.accepted().len(), 1);
    assert_eq!(report.accepted()[0].relay_url, accepting.url());
    let rejected = report.rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0, refusing.url());
    assert!(matches!(rejected[0].1, ClientError::Rejected(reason) if reason == "blocked: not on allowlist"));
}

#[tokio::test]
async fn test_fetch_merges_and_deduplicates() {
    let relay_a = MockRelay::start().await;
    let relay_b = MockRelay::start().await;
    let keys = Keys::generate();
    let (pool, mut peers) = pool_of(&[&relay_a, &relay_b], keys.clone()).await;
    let mut pool_events = pool.notifications();

    let mut subscription = pool
        .fetch(vec![Filter::new().authors(vec![keys.public_key().to_string()])])
        .await
        .unwrap();
    assert_eq!(subscription.relays().len(), 2);

    let shared = note(&keys, "on both relays");
    let only_b = note(&keys, "only on b");
    for peer in peers.iter_mut() {
        let id = peer.recv_req().await;
        assert_eq!(id, subscription.id());
        peer.send_event(&id, &shared).await;
    }
    peers[1].send_event(subscription.id(), &only_b).await;
    for peer in peers.iter_mut() {
        peer.send_eose(subscription.id()).await;
    }

    let mut received = Vec::new();
    while let Some(event) = subscription.next().await.unwrap() {
        received.push(event.id);
    }
    received.sort();
    let mut expected = vec![shared.id.clone(), only_b.id.clone()];
    expected.sort();
    assert_eq!(received, expected);

    let id = subscription.id().to_string();
    wait_for(&mut pool_events, |event| {
        *event == PoolEvent::AllEose {
            subscription_id: id.clone(),
        }
    })
    .await;

    // Each relay is told to stop once it has sent EOSE.
    for peer in peers.iter_mut() {
        assert_eq!(
            peer.recv_frame().await,
            ClientMessage::Close {
                subscription_id: id.clone()
            }
        );
    }
}

#[tokio::test]
async fn test_fetch_waits_for_every_relay() {
    let fast = MockRelay::start().await;
    let slow = MockRelay::start().await;
    let keys = Keys::generate();
    let (pool, mut peers) = pool_of(&[&fast, &slow], keys.clone()).await;
    let mut pool_events = pool.notifications();

    let mut subscription = pool.fetch(vec![Filter::new().kinds(vec![1])]).await.unwrap();
    let id = subscription.id().to_string();
    let (first, second) = peers.split_at_mut(1);
    let (fast_peer, slow_peer) = (&mut first[0], &mut second[0]);

    assert_eq!(fast_peer.recv_req().await, id);
    fast_peer.send_eose(&id).await;
    wait_for(&mut pool_events, |event| {
        matches!(event, PoolEvent::Eose { relay_url, .. } if relay_url == fast.url())
    })
    .await;
    assert!(!matches!(subscription.state(), SubscriptionState::Closed(_)));

    let late = note(&keys, "from the slow relay");
    assert_eq!(slow_peer.recv_req().await, id);
    slow_peer.send_event(&id, &late).await;
    slow_peer.send_eose(&id).await;

    assert_eq!(subscription.next().await.unwrap(), Some(late));
    assert_eq!(subscription.next().await.unwrap(), None);
}

#[tokio::test]
async fn test_query_collects_until_eose() {
    let relay = MockRelay::start().await;
    let keys = Keys::generate();
    let (pool, mut peers) = pool_of(&[&relay], keys.clone()).await;
    let peer = &mut peers[0];

    let stored = vec![note(&keys, "one"), note(&keys, "two")];
    let serve = async {
        let id = peer.recv_req().await;
        for event in &stored {
            peer.send_event(&id, event).await;
        }
        peer.send_eose(&id).await;
    };
    let (events, ()) = tokio::join!(
        pool.query(vec![Filter::new().kinds(vec![1])], Duration::from_secs(5)),
        serve
    );

    assert_eq!(events.unwrap(), stored);
}

#[tokio::test]
async fn test_query_returns_partial_results_on_timeout() {
    let relay = MockRelay::start().await;
    let keys = Keys::generate();
    let (pool, mut peers) = pool_of(&[&relay], keys.clone()).await;
    let peer = &mut peers[0];

    let stored = note(&keys, "the only one");
    let serve = async {
        let id = peer.recv_req().await;
        peer.send_event(&id, &stored).await;
    };
    let (events, ()) = tokio::join!(
        pool.query(vec![Filter::new().kinds(vec![1])], Duration::from_millis(300)),
        serve
    );

    assert_eq!(events.unwrap(), vec![stored]);
}

#[tokio::test]
async fn test_delete_publishes_deletion_request() {
    let relay = MockRelay::start().await;
    let (pool, mut peers) = pool_of(&[&relay], Keys::generate()).await;
    let peer = &mut peers[0];
    let target = "b".repeat(64);

    let serve = async {
        let event = peer.recv_event().await;
        peer.send_ok(&event.id, true, "").await;
        event
    };
    let (report, event) = tokio::join!(pool.delete(&target, Some("typo")), serve);

    assert!(report.unwrap().is_success());
    assert!(is_deletion_request(&event));
    assert_eq!(deleted_event_ids(&event), vec![target.as_str()]);
    assert_eq!(event.content, "typo");
}

#[tokio::test]
async fn test_react_tags_target() {
    let relay = MockRelay::start().await;
    let (pool, mut peers) = pool_of(&[&relay], Keys::generate()).await;
    let peer = &mut peers[0];
    let target = "c".repeat(64);
    let author = "d".repeat(64);

    let serve = async {
        let event = peer.recv_event().await;
        peer.send_ok(&event.id, true, "").await;
        event
    };
    let (report, event) = tokio::join!(pool.react(&target, Some(&author), "🤙"), serve);

    assert!(report.unwrap().is_success());
    assert_eq!(event.kind, 7);
    assert_eq!(event.content, "🤙");
    assert_eq!(reacted_event_id(&event), Some(target.as_str()));
    assert!(event.tags.contains(&vec!["p".to_string(), author]));
}

#[tokio::test]
async fn test_connect_reports_unreachable_relay() {
    let relay = MockRelay::start().await;
    let dead = dead_url().await;
    let config = SessionConfig::new([relay.url().to_string(), dead.clone()]).with_relay_config(
        RelayConfig {
            connect_timeout: Duration::from_secs(2),
            ..RelayConfig::default()
        },
    );
    let pool = RelayPool::new(config).unwrap();

    let (results, _peer) = tokio::join!(pool.connect(), relay.accept());

    assert_eq!(results.len(), 2);
    for (url, result) in &results {
        if url == &dead {
            assert!(matches!(result, Err(ClientError::Connection(_))));
        } else {
            assert!(result.is_ok());
        }
    }
    assert_eq!(pool.connected_count(), 1);
}

#[tokio::test]
async fn test_live_subscription_survives_reconnect() {
    let relay = MockRelay::start().await;
    let keys = Keys::generate();
    let config = SessionConfig::new([relay.url()])
        .with_keys(keys.clone())
        .with_auto_reconnect(true)
        .with_relay_config(RelayConfig {
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(100),
            ..RelayConfig::default()
        });
    let pool = RelayPool::new(config).unwrap();
    let (_, mut peer) = tokio::join!(pool.connect(), relay.accept());
    let mut pool_events = pool.notifications();

    let mut subscription = pool
        .subscribe(vec![Filter::new().kinds(vec![1])])
        .await
        .unwrap();
    let id = peer.recv_req().await;
    drop(peer);

    wait_for(&mut pool_events, |event| {
        matches!(event, PoolEvent::Disconnected { .. })
    })
    .await;
    let mut peer = relay.accept().await;
    assert_eq!(peer.recv_req().await, id);

    let event = note(&keys, "after reconnect");
    peer.send_event(&id, &event).await;
    let received = timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, Some(event));
}

#[tokio::test]
async fn test_subscribe_needs_connected_relay() {
    let pool = RelayPool::new(SessionConfig::new([dead_url().await])).unwrap();
    assert!(matches!(
        pool.subscribe(vec![Filter::new()]).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_disconnect_all_cancels_pending_reconnect() {
    let relay = MockRelay::start().await;
    let config = SessionConfig::new([relay.url()])
        .with_auto_reconnect(true)
        .with_relay_config(RelayConfig {
            reconnect_delay: Duration::from_millis(200),
            max_reconnect_delay: Duration::from_millis(200),
            ..RelayConfig::default()
        });
    let pool = RelayPool::new(config).unwrap();
    let (_, peer) = tokio::join!(pool.connect(), relay.accept());
    let mut pool_events = pool.notifications();

    drop(peer);
    wait_for(&mut pool_events, |event| {
        matches!(event, PoolEvent::Disconnected { .. })
    })
    .await;
    pool.disconnect_all().await;

    // A reconnect still running would get through here.
    let late = relay.accept_within(Duration::from_millis(600)).await;
    assert!(late.is_none());
    assert_eq!(pool.connected_count(), 0);
    assert_eq!(
        pool.states(),
        vec![(relay.url().to_string(), ConnectionState::Disconnected)]
    );
}

#[tokio::test]
async fn test_remove_relay_cancels_pending_reconnect() {
    let relay = MockRelay::start().await;
    let config = SessionConfig::new([relay.url()])
        .with_auto_reconnect(true)
        .with_relay_config(RelayConfig {
            reconnect_delay: Duration::from_millis(200),
            max_reconnect_delay: Duration::from_millis(200),
            ..RelayConfig::default()
        });
    let pool = RelayPool::new(config).unwrap();
    let (_, peer) = tokio::join!(pool.connect(), relay.accept());
    let connection = pool.connection(relay.url()).unwrap();
    let mut pool_events = pool.notifications();

    drop(peer);
    wait_for(&mut pool_events, |event| {
        matches!(event, PoolEvent::Disconnected { .. })
    })
    .await;
    assert!(pool.remove_relay(relay.url()).await.unwrap());

    assert!(relay.accept_within(Duration::from_millis(600)).await.is_none());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dropping_pool_closes_connections() {
    let relay = MockRelay::start().await;
    let (pool, mut peers) = pool_of(&[&relay], Keys::generate()).await;

    drop(pool);

    peers[0].expect_hangup().await;
}
