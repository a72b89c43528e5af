//! Hub fan-out behavior: entitlement, filtering, broadcast, backpressure,
//! and the counter invariants, driven through the routing entry point.

use std::sync::Arc;
use std::time::Duration;

use notifier::hub::{Hub, OUTBOUND_QUEUE_CAPACITY, SessionHandle};
use notifier::webhook::AlertDispatcher;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn session(user_id: &str, filter: Option<&str>) -> (SessionHandle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let handle = SessionHandle {
        id: Uuid::new_v4(),
        user_id: user_id.to_owned(),
        project_filter: filter.map(ToOwned::to_owned),
        outbound: tx,
    };
    (handle, rx)
}

fn spawn_hub(max_connections: usize) -> Arc<Hub> {
    let hub = Hub::new(max_connections, AlertDispatcher::disabled());
    tokio::spawn(hub.clone().run());
    hub
}

/// Registration flows through the hub's intake loop, so tests poll for the
/// counter to settle.
async fn wait_for_active(hub: &Hub, expected: usize) {
    for _ in 0..200 {
        if hub.stats().active_connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("hub never reached {expected} active connections");
}

async fn recv_envelope(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("outbound queue closed unexpectedly");
    serde_json::from_str(&frame).expect("envelope must be valid JSON")
}

async fn assert_no_envelope(rx: &mut mpsc::Receiver<String>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        rx.try_recv().is_err(),
        "session must not have received an envelope"
    );
}

const ONBOARDING_BODY: &[u8] = br#"{"source_id":"s","record_count":3}"#;

// ---------------------------------------------------------------------------
// Project fan-out and filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn project_event_reaches_matching_filter_and_unfiltered_sessions() {
    let hub = spawn_hub(8);
    let (filtered, mut filtered_rx) = session("u1", Some("proj_a"));
    let (unfiltered, mut unfiltered_rx) = session("u1", None);
    hub.register(filtered).await;
    hub.register(unfiltered).await;
    wait_for_active(&hub, 2).await;

    hub.process_message("project:proj_a:user:u1", ONBOARDING_BODY)
        .await
        .expect("routing should succeed");

    for rx in [&mut filtered_rx, &mut unfiltered_rx] {
        let envelope = recv_envelope(rx).await;
        assert_eq!(envelope["type"], "DATA_ONBOARDING");
        assert_eq!(envelope["payload"]["source_id"], "s");
        assert_eq!(envelope["payload"]["record_count"], 3);
        assert!(envelope["timestamp"].is_string());
    }

    // A different project only reaches the unfiltered session.
    hub.process_message("project:proj_b:user:u1", ONBOARDING_BODY)
        .await
        .expect("routing should succeed");

    let envelope = recv_envelope(&mut unfiltered_rx).await;
    assert_eq!(envelope["type"], "DATA_ONBOARDING");
    assert_no_envelope(&mut filtered_rx).await;

    let stats = hub.stats();
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(stats.sent_by_kind.data_onboarding, 2);
}

#[tokio::test]
async fn project_event_never_reaches_other_users() {
    let hub = spawn_hub(8);
    let (target, mut target_rx) = session("u1", None);
    let (bystander, mut bystander_rx) = session("u2", None);
    hub.register(target).await;
    hub.register(bystander).await;
    wait_for_active(&hub, 2).await;

    hub.process_message("project:proj_a:user:u1", ONBOARDING_BODY)
        .await
        .expect("routing should succeed");

    recv_envelope(&mut target_rx).await;
    assert_no_envelope(&mut bystander_rx).await;
}

#[tokio::test]
async fn alert_event_ignores_the_project_filter() {
    let hub = spawn_hub(8);
    let (filtered, mut filtered_rx) = session("u1", Some("proj_a"));
    hub.register(filtered).await;
    wait_for_active(&hub, 1).await;

    hub.process_message(
        "alert:crisis:user:u1",
        br#"{"alert_type":"spike","severity":"high"}"#,
    )
    .await
    .expect("routing should succeed");

    let envelope = recv_envelope(&mut filtered_rx).await;
    assert_eq!(envelope["type"], "CRISIS_ALERT");
}

#[tokio::test]
async fn campaign_event_respects_the_filter_on_campaign_id() {
    let hub = spawn_hub(8);
    let (matching, mut matching_rx) = session("u1", Some("cmp_1"));
    let (other, mut other_rx) = session("u1", Some("cmp_2"));
    hub.register(matching).await;
    hub.register(other).await;
    wait_for_active(&hub, 2).await;

    hub.process_message(
        "campaign:cmp_1:user:u1",
        br#"{"campaign_id":"cmp_1","event":"started"}"#,
    )
    .await
    .expect("routing should succeed");

    let envelope = recv_envelope(&mut matching_rx).await;
    assert_eq!(envelope["type"], "CAMPAIGN_EVENT");
    assert_no_envelope(&mut other_rx).await;
}

// ---------------------------------------------------------------------------
// System broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn system_event_broadcasts_to_every_session() {
    let hub = spawn_hub(8);
    let (first, mut first_rx) = session("u1", Some("proj_a"));
    let (second, mut second_rx) = session("u2", None);
    hub.register(first).await;
    hub.register(second).await;
    wait_for_active(&hub, 2).await;

    hub.process_message("system:maintenance", br#"{"system_event":"restart"}"#)
        .await
        .expect("routing should succeed");

    for rx in [&mut first_rx, &mut second_rx] {
        let envelope = recv_envelope(rx).await;
        assert_eq!(envelope["type"], "SYSTEM");
        assert_eq!(envelope["payload"]["system_event"], "restart");
    }
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_drops_the_message_and_keeps_the_session_alive() {
    let hub = spawn_hub(8);
    let (handle, mut rx) = session("u1", Some("proj_a"));
    let fill_tx = handle.outbound.clone();
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    for i in 0..OUTBOUND_QUEUE_CAPACITY {
        fill_tx
            .try_send(format!("fill-{i}"))
            .expect("queue should accept up to its capacity");
    }

    hub.process_message("project:proj_a:user:u1", ONBOARDING_BODY)
        .await
        .expect("routing should succeed even when the queue is full");

    let stats = hub.stats();
    assert_eq!(stats.messages_failed, 1, "the drop must be counted");
    assert_eq!(stats.messages_sent, 0);
    assert_eq!(
        stats.active_connections, 1,
        "a slow session must stay alive"
    );

    // The queue still holds exactly the pre-filled backlog.
    let mut drained = 0;
    while let Ok(value) = rx.try_recv() {
        assert!(value.starts_with("fill-"));
        drained += 1;
    }
    assert_eq!(drained, OUTBOUND_QUEUE_CAPACITY);
}

// ---------------------------------------------------------------------------
// Malformed inputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unroutable_channel_is_dropped_without_touching_sessions() {
    let hub = spawn_hub(8);
    let (handle, mut rx) = session("u1", None);
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    hub.process_message("not:a:valid:channel", ONBOARDING_BODY)
        .await
        .expect("bad channels are dropped, not errors");

    assert_no_envelope(&mut rx).await;
    let stats = hub.stats();
    assert_eq!(stats.inputs_dropped, 1);
    assert_eq!(stats.messages_sent, 0);
}

#[tokio::test]
async fn unknown_payload_kind_is_dropped() {
    let hub = spawn_hub(8);
    let (handle, mut rx) = session("u1", None);
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    hub.process_message("project:proj_a:user:u1", br#"{"unrelated":"fields"}"#)
        .await
        .expect("unknown kinds are dropped, not errors");

    assert_no_envelope(&mut rx).await;
    assert_eq!(hub.stats().inputs_dropped, 1);
}

#[tokio::test]
async fn transform_failure_propagates_and_delivers_nothing() {
    let hub = spawn_hub(8);
    let (handle, mut rx) = session("u1", None);
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    let result = hub
        .process_message(
            "project:proj_a:user:u1",
            br#"{"source_id":"s","record_count":"three"}"#,
        )
        .await;
    assert!(result.is_err(), "shape mismatch must surface to the caller");
    assert_no_envelope(&mut rx).await;
}

// ---------------------------------------------------------------------------
// Counter invariants and connection events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_counters_partition_by_filter_and_sum_to_active() {
    let hub = spawn_hub(8);
    let (a, _a_rx) = session("u1", Some("proj_a"));
    let (b, _b_rx) = session("u1", None);
    let (c, _c_rx) = session("u2", None);
    hub.register(a).await;
    hub.register(b).await;
    hub.register(c).await;
    wait_for_active(&hub, 3).await;

    let stats = hub.stats();
    assert_eq!(stats.filtered_connections, 1);
    assert_eq!(stats.unfiltered_connections, 2);
    assert_eq!(
        stats.filtered_connections + stats.unfiltered_connections,
        stats.active_connections
    );
}

#[tokio::test]
async fn connection_events_report_has_others_per_user() {
    let hub = spawn_hub(8);
    let mut events = hub.subscribe_connection_events();

    let (first, _first_rx) = session("u1", None);
    let (second, _second_rx) = session("u1", None);
    let first_id = first.id;
    hub.register(first).await;
    hub.register(second).await;
    wait_for_active(&hub, 2).await;

    let connected_first = events.recv().await.expect("first register event");
    assert!(connected_first.connected);
    assert!(!connected_first.has_others);
    let connected_second = events.recv().await.expect("second register event");
    assert!(connected_second.connected);
    assert!(connected_second.has_others);

    hub.unregister("u1", first_id).await;
    wait_for_active(&hub, 1).await;
    let disconnected = events.recv().await.expect("unregister event");
    assert!(!disconnected.connected);
    assert!(
        disconnected.has_others,
        "one session must remain for the user"
    );
}
