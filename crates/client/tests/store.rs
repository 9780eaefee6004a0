mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{next_envelope, next_link, recorder, sse_store, store_with, websocket_store};
use genstream_client::{
    BackoffPolicy, Channel, ConnectionState, EnvelopeKind, EventHandler, HandlerError, OwnerTag,
    ReconnectPolicy, SubscribeOptions, TransportEvent, TransportKind,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;

#[tokio::test]
async fn two_subscribers_share_one_transport() {
    let (store, transport, mut links) = websocket_store();
    let (a_handler, mut a_rx) = recorder();
    let (b_handler, mut b_rx) = recorder();

    let a = store.subscribe("file.123", vec![a_handler], SubscribeOptions::default());
    let b = store.subscribe("file.123", vec![b_handler], SubscribeOptions::default());

    let link = next_link(&mut links).await;
    assert_eq!(link.request.channel, Channel::file(123));
    assert_eq!(transport.open_count(), 1);

    link.send(r#"{"type":"finish","url":"https://cdn/v.mp4"}"#);
    assert_eq!(next_envelope(&mut a_rx).await.kind, EnvelopeKind::Finish);
    assert_eq!(next_envelope(&mut b_rx).await.kind, EnvelopeKind::Finish);

    let info = store.debug_info();
    assert_eq!(info.transports_opened, 1);
    assert_eq!(info.total_handlers, 2);
    assert_eq!(info.channels[0].owners, 2);

    a.disconnect();
    assert_eq!(store.handler_count(&Channel::file(123)), 1);

    link.send(r#"{"type":"progress","progress":50}"#);
    let envelope = next_envelope(&mut b_rx).await;
    assert_eq!(envelope.progress_percent(), Some(50.0));
    assert!(matches!(a_rx.try_recv(), Err(TryRecvError::Empty)));

    b.disconnect();
    tokio::time::timeout(Duration::from_secs(5), link.tx.closed())
        .await
        .expect("transport closed after last handler left");

    let info = store.debug_info();
    assert_eq!(info.total_handlers, 0);
    assert!(info.channels.is_empty());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn late_joiner_and_early_leaver_on_shared_channel() {
    let (store, transport, mut links) = websocket_store();
    let (h1, mut h1_rx) = recorder();
    let (h2, mut h2_rx) = recorder();

    let a = store.subscribe("file.123", vec![h1], SubscribeOptions::default());
    let link = next_link(&mut links).await;

    link.send(r#"{"type":"progress","progress":40}"#);
    assert_eq!(next_envelope(&mut h1_rx).await.progress, Some(40.0));

    let _b = store.subscribe("file.123", vec![h2], SubscribeOptions::default());
    link.send(r#"{"type":"progress","progress":70}"#);
    assert_eq!(next_envelope(&mut h1_rx).await.progress, Some(70.0));
    assert_eq!(next_envelope(&mut h2_rx).await.progress, Some(70.0));

    drop(a);
    link.send(r#"{"type":"finish"}"#);
    assert_eq!(next_envelope(&mut h2_rx).await.kind, EnvelopeKind::Finish);
    assert!(matches!(h1_rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(h2_rx.try_recv().is_err());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn frames_are_delivered_in_order_and_bad_frames_dropped() {
    let (store, _transport, mut links) = websocket_store();
    let (handler, mut rx) = recorder();
    let _sub = store.subscribe(Channel::project(7), vec![handler], SubscribeOptions::default());
    let link = next_link(&mut links).await;

    link.send("not json at all");
    link.send(r#"{"progress":10}"#);
    link.send(r#"{"type":"thumbnail_ready","requestId":"r1"}"#);
    link.send(r#"{"type":"progress","requestId":"r1","progress":"20"}"#);
    link.send(r#"{"type":"completed","requestId":"r1"}"#);

    let kinds = [
        next_envelope(&mut rx).await.kind,
        next_envelope(&mut rx).await.kind,
        next_envelope(&mut rx).await.kind,
    ];
    assert_eq!(
        kinds,
        [
            EnvelopeKind::Other("thumbnail_ready".to_string()),
            EnvelopeKind::Progress,
            EnvelopeKind::Completed,
        ]
    );
}

#[tokio::test]
async fn failing_handlers_do_not_block_others() {
    let (store, _transport, mut links) = websocket_store();
    let (handler, mut rx) = recorder();
    let failing = EventHandler::new(|_| Err(HandlerError::msg("nope")));
    let panicking = EventHandler::from_fn(|_| panic!("handler blew up"));

    let _sub = store.subscribe(
        Channel::file(1),
        vec![failing, panicking, handler],
        SubscribeOptions::default(),
    );
    let link = next_link(&mut links).await;
    link.send(r#"{"type":"status","status":"processing"}"#);
    link.send(r#"{"type":"status","status":"done"}"#);

    assert_eq!(next_envelope(&mut rx).await.status.as_deref(), Some("processing"));
    assert_eq!(next_envelope(&mut rx).await.status.as_deref(), Some("done"));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (store, _transport, mut links) = websocket_store();
    let (a_handler, _a_rx) = recorder();
    let (b_handler, _b_rx) = recorder();
    let a = store.subscribe("file.9", vec![a_handler], SubscribeOptions::default());
    let _b = store.subscribe("file.9", vec![b_handler], SubscribeOptions::default());
    let _link = next_link(&mut links).await;

    a.disconnect();
    a.disconnect();
    drop(a);

    assert_eq!(store.handler_count(&Channel::file(9)), 1);
}

#[tokio::test]
async fn handler_can_unsubscribe_itself_mid_stream() {
    let (store, _transport, mut links) = websocket_store();
    let owner = OwnerTag::new("self-removing");
    let calls = Arc::new(AtomicUsize::new(0));

    let self_removing = {
        let store = store.clone();
        let owner = owner.clone();
        let calls = calls.clone();
        EventHandler::from_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            store.remove_project_handlers(&owner, &[]);
        })
    };
    let (witness, mut witness_rx) = recorder();

    let _a = store.subscribe(
        "file.5",
        vec![self_removing],
        SubscribeOptions::default().with_owner(owner.clone()),
    );
    let _b = store.subscribe("file.5", vec![witness], SubscribeOptions::default());
    let link = next_link(&mut links).await;

    link.send(r#"{"type":"progress","progress":1}"#);
    link.send(r#"{"type":"progress","progress":2}"#);
    next_envelope(&mut witness_rx).await;
    next_envelope(&mut witness_rx).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.handler_count(&Channel::file(5)), 1);
}

#[tokio::test]
async fn disabled_subscription_opens_nothing() {
    let (store, transport, _links) = websocket_store();
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.2", vec![handler], SubscribeOptions::disabled());
    tokio::task::yield_now().await;

    assert!(!sub.is_active());
    assert!(!sub.is_connected());
    assert_eq!(sub.connection_attempts(), 0);
    assert_eq!(sub.max_attempts(), 3);
    assert!(sub.watch_status().is_none());
    assert_eq!(transport.open_count(), 0);
    assert_eq!(store.debug_info().total_handlers, 0);
}

#[tokio::test]
async fn enabling_later_registers() {
    let (store, _transport, mut links) = websocket_store();
    let (handler, _rx) = recorder();

    let mut sub = store.subscribe("file.3", vec![handler], SubscribeOptions::disabled());
    sub.set_enabled(true);
    let link = next_link(&mut links).await;
    assert_eq!(link.request.channel, Channel::file(3));
    assert!(sub.is_active());

    sub.set_enabled(false);
    assert_eq!(store.handler_count(&Channel::file(3)), 0);
}

#[tokio::test]
async fn resubscribe_moves_registration() {
    let (store, transport, mut links) = websocket_store();
    let (handler, mut rx) = recorder();

    let mut sub = store.subscribe("file.10", vec![handler], SubscribeOptions::default());
    let first = next_link(&mut links).await;

    sub.resubscribe("file.11");
    let second = next_link(&mut links).await;
    assert_eq!(second.request.channel, Channel::file(11));
    assert_eq!(sub.channel(), &Channel::file(11));
    assert_eq!(store.handler_count(&Channel::file(10)), 0);
    assert_eq!(store.handler_count(&Channel::file(11)), 1);
    tokio::time::timeout(Duration::from_secs(5), first.tx.closed())
        .await
        .expect("old transport closed");

    second.send(r#"{"type":"finish"}"#);
    assert_eq!(next_envelope(&mut rx).await.kind, EnvelopeKind::Finish);
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn status_follows_transport() {
    let (store, _transport, mut links) = websocket_store();
    let (handler, _rx) = recorder();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = seen.clone();
        store.add_connection_handler(move |channel, status| {
            seen.lock().push((channel.clone(), status.state));
        })
    };

    let sub = store.subscribe("file.4", vec![handler], SubscribeOptions::default());
    let mut status = sub.watch_status().expect("live channel");
    let _link = next_link(&mut links).await;

    status
        .wait_for(|s| s.is_connected())
        .await
        .expect("status sender alive");
    assert!(sub.is_connected());
    assert_eq!(sub.connection_attempts(), 0);

    let states: Vec<ConnectionState> = seen.lock().iter().map(|(_, state)| *state).collect();
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);

    assert!(store.remove_connection_handler(listener));
    sub.disconnect();
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn websocket_backoff_doubles_then_gives_up() {
    let (store, transport, mut links) = websocket_store();
    transport.set_failing(true);
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.123", vec![handler], SubscribeOptions::default());
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.is_exhausted())
        .await
        .expect("status sender alive");

    let opens = transport.open_times();
    assert_eq!(opens.len(), 4);
    let gaps: Vec<u128> = opens.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    assert_eq!(gaps, vec![2000, 4000, 8000]);

    assert_eq!(sub.connection_attempts(), 3);
    assert_eq!(sub.connection_attempts(), sub.max_attempts());
    assert!(!sub.is_connected());
    assert_eq!(transport.open_count(), 4);
    assert_eq!(store.debug_info().open_transports, 0);

    transport.set_failing(false);
    sub.reconnect();
    let _link = next_link(&mut links).await;
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.is_connected())
        .await
        .expect("status sender alive");
    assert_eq!(sub.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn last_retry_runs_before_exhaustion_is_reported() {
    let (store, transport, _links) = websocket_store();
    transport.set_failing(true);
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.5", vec![handler], SubscribeOptions::default());
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.attempts == 3)
        .await
        .expect("status sender alive");
    assert!(!status.borrow().is_exhausted());
    assert_eq!(transport.open_count(), 3);

    status
        .wait_for(|s| s.is_exhausted())
        .await
        .expect("status sender alive");
    assert_eq!(transport.open_count(), 4);
    assert!(status.borrow().gave_up);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_attempts() {
    let (store, transport, mut links) = websocket_store();
    transport.set_failing(true);
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.8", vec![handler], SubscribeOptions::default());
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.attempts == 1)
        .await
        .expect("status sender alive");

    transport.set_failing(false);
    let link = next_link(&mut links).await;
    status
        .wait_for(|s| s.is_connected())
        .await
        .expect("status sender alive");
    assert_eq!(sub.connection_attempts(), 0);

    drop(link);
    status
        .wait_for(|s| s.attempts == 1 && s.state == ConnectionState::Disconnected)
        .await
        .expect("status sender alive");
    let _again = next_link(&mut links).await;
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test]
async fn native_policy_leaves_recovery_to_transport() {
    let (store, transport, mut links) = sse_store();
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.6", vec![handler], SubscribeOptions::default());
    assert_eq!(sub.max_attempts(), 0);
    let link = next_link(&mut links).await;

    link.tx
        .send(TransportEvent::Error(genstream_client::TransportError::Closed))
        .expect("stream alive");
    link.tx.send(TransportEvent::Open).expect("stream alive");
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.is_connected())
        .await
        .expect("status sender alive");
    assert_eq!(transport.open_count(), 1);

    drop(link);
    status
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .expect("status sender alive");
    tokio::task::yield_now().await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(sub.connection_attempts(), 0);
    assert_eq!(store.handler_count(&Channel::file(6)), 1);
}

#[tokio::test]
async fn native_open_failure_reports_exhausted() {
    let (store, transport, _links) = sse_store();
    transport.set_failing(true);
    let (handler, _rx) = recorder();

    let sub = store.subscribe("file.6", vec![handler], SubscribeOptions::default());
    let mut status = sub.watch_status().expect("live channel");
    status
        .wait_for(|s| s.is_exhausted())
        .await
        .expect("status sender alive");
    assert_eq!(sub.max_attempts(), 0);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(store.debug_info().open_transports, 0);
}

#[tokio::test]
async fn leak_threshold_forces_cleanup() {
    let (store, _transport, mut links) = store_with(
        TransportKind::WebSocket,
        ReconnectPolicy::Backoff(BackoffPolicy::default()),
        5,
    );
    let mut subs = Vec::new();
    for _ in 0..5 {
        let (handler, _rx) = recorder();
        subs.push(store.subscribe("file.1", vec![handler], SubscribeOptions::default()));
    }
    let first = next_link(&mut links).await;
    assert_eq!(store.handler_count(&Channel::file(1)), 5);

    let (handler, mut rx) = recorder();
    let trigger = store.subscribe("file.1", vec![handler], SubscribeOptions::default());

    assert_eq!(store.handler_count(&Channel::file(1)), 1);
    assert_eq!(store.debug_info().total_handlers, 1);
    tokio::time::timeout(Duration::from_secs(5), first.tx.closed())
        .await
        .expect("old transport closed");

    let second = next_link(&mut links).await;
    second.send(r#"{"type":"progress","progress":5}"#);
    next_envelope(&mut rx).await;
    assert!(trigger.is_active());
    assert!(subs.iter().all(|sub| !sub.is_active()));
}

#[tokio::test]
async fn evicted_handle_stops_reporting_connected() {
    let (store, _transport, mut links) = store_with(
        TransportKind::WebSocket,
        ReconnectPolicy::Backoff(BackoffPolicy::default()),
        1,
    );
    let (a_handler, mut a_rx) = recorder();
    let a = store.subscribe("file.3", vec![a_handler], SubscribeOptions::default());
    let _first = next_link(&mut links).await;

    let (b_handler, mut b_rx) = recorder();
    let b = store.subscribe("file.3", vec![b_handler], SubscribeOptions::default());
    let second = next_link(&mut links).await;
    let mut status = b.watch_status().expect("live channel");
    status
        .wait_for(|s| s.is_connected())
        .await
        .expect("status sender alive");

    second.send(r#"{"type":"progress","progress":20}"#);
    next_envelope(&mut b_rx).await;
    assert!(matches!(a_rx.try_recv(), Err(TryRecvError::Empty)));

    assert!(b.is_connected());
    assert!(!a.is_active());
    assert!(!a.is_connected());
    assert_eq!(a.connection_attempts(), 0);
    assert!(a.watch_status().is_none());
    assert_eq!(store.handler_count(&Channel::file(3)), 1);

    a.disconnect();
    assert_eq!(store.handler_count(&Channel::file(3)), 1);
    assert!(b.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_from_another_thread_waits_for_dispatch() {
    let (store, _transport, mut links) = websocket_store();
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let in_handler = Arc::new(Barrier::new(2));
    let first_call = Arc::new(AtomicBool::new(true));

    let handler = {
        let log = log.clone();
        let in_handler = in_handler.clone();
        EventHandler::from_fn(move |_| {
            if first_call.swap(false, Ordering::SeqCst) {
                in_handler.wait();
                std::thread::sleep(Duration::from_millis(200));
            }
            log.lock().push("handled");
        })
    };
    let sub = Arc::new(store.subscribe("file.10", vec![handler], SubscribeOptions::default()));
    let link = next_link(&mut links).await;
    link.send(r#"{"type":"progress","progress":1}"#);

    let remote = {
        let sub = sub.clone();
        let log = log.clone();
        std::thread::spawn(move || {
            in_handler.wait();
            sub.disconnect();
            log.lock().push("disconnected");
        })
    };
    tokio::task::spawn_blocking(move || remote.join())
        .await
        .expect("join task")
        .expect("disconnect thread panicked");

    let _ = link.tx.send(TransportEvent::Message(
        r#"{"type":"progress","progress":2}"#.to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*log.lock(), vec!["handled", "disconnected"]);
    assert!(!sub.is_active());
}

#[tokio::test]
async fn zero_threshold_disables_leak_valve() {
    let (store, _transport, _links) = store_with(
        TransportKind::WebSocket,
        ReconnectPolicy::Backoff(BackoffPolicy::default()),
        0,
    );
    let subs: Vec<_> = (0..8)
        .map(|_| {
            let (handler, _rx) = recorder();
            store.subscribe("file.1", vec![handler], SubscribeOptions::default())
        })
        .collect();
    assert_eq!(store.handler_count(&Channel::file(1)), 8);
    drop(subs);
    assert_eq!(store.handler_count(&Channel::file(1)), 0);
}

#[tokio::test]
async fn force_cleanup_drops_everything() {
    let (store, _transport, mut links) = websocket_store();
    let (a, _a_rx) = recorder();
    let (b, _b_rx) = recorder();
    let _x = store.subscribe("file.1", vec![a], SubscribeOptions::default());
    let _y = store.subscribe("project.2", vec![b], SubscribeOptions::default());
    let one = next_link(&mut links).await;
    let two = next_link(&mut links).await;

    store.force_cleanup();

    let info = store.debug_info();
    assert_eq!(info.total_handlers, 0);
    assert_eq!(info.open_transports, 0);
    assert!(info.states.is_empty());
    tokio::time::timeout(Duration::from_secs(5), one.tx.closed())
        .await
        .expect("first transport closed");
    tokio::time::timeout(Duration::from_secs(5), two.tx.closed())
        .await
        .expect("second transport closed");
}

#[tokio::test]
async fn project_handlers_removed_across_channels() {
    let (store, _transport, mut links) = websocket_store();
    let owner = OwnerTag::new("project-42");
    let (a, _a_rx) = recorder();
    let (b, _b_rx) = recorder();
    let (other, _other_rx) = recorder();

    let _one = store.subscribe("file.1", vec![a], SubscribeOptions::default().with_owner(owner.clone()));
    let _two = store.subscribe("file.2", vec![b], SubscribeOptions::default().with_owner(owner.clone()));
    let _three = store.subscribe("file.2", vec![other], SubscribeOptions::default());
    next_link(&mut links).await;
    next_link(&mut links).await;

    assert_eq!(store.remove_project_handlers(&owner, &[]), 2);
    assert_eq!(store.remove_project_handlers(&owner, &[]), 0);

    let info = store.debug_info();
    assert_eq!(info.total_handlers, 1);
    assert_eq!(info.channels.len(), 1);
    assert_eq!(info.channels[0].channel, Channel::file(2));
}

#[tokio::test]
async fn correlation_id_reaches_transport() {
    let (store, _transport, mut links) = websocket_store();
    let (handler, _rx) = recorder();
    let _sub = store.subscribe(
        "file.77",
        vec![handler],
        SubscribeOptions::default().with_correlation_id("trace-abc"),
    );
    let link = next_link(&mut links).await;
    assert_eq!(link.request.correlation_id.as_deref(), Some("trace-abc"));
    assert_eq!(link.request.url, "mem://file.77");
}
