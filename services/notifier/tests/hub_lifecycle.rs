//! Hub lifecycle: capacity rejection, queue-close ownership, and graceful
//! shutdown coordination with session workers.

use std::sync::Arc;
use std::time::Duration;

use notifier::hub::{Hub, OUTBOUND_QUEUE_CAPACITY, SessionHandle, ShutdownError};
use notifier::webhook::AlertDispatcher;
use tokio::sync::mpsc;
use uuid::Uuid;

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

async fn wait_for_active(hub: &Hub, expected: usize) {
    for _ in 0..200 {
        if hub.stats().active_connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("hub never reached {expected} active connections");
}

/// Stand-in for a session worker: consumes the queue, reacts to the shutdown
/// signal, and unregisters on exit, the way the real reader/writer pair does.
fn spawn_worker(hub: &Arc<Hub>, handle: &SessionHandle, mut rx: mpsc::Receiver<String>) {
    let hub = hub.clone();
    let user_id = handle.user_id.clone();
    let session_id = handle.id;
    let mut shutdown = hub.shutdown_signal();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                item = rx.recv() => {
                    if item.is_none() {
                        break;
                    }
                }
            }
        }
        hub.unregister(&user_id, session_id).await;
    });
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registrations_beyond_capacity_are_rejected_and_closed() {
    let hub = spawn_hub(2);
    let (first, _first_rx) = session("u1", None);
    let (second, _second_rx) = session("u2", None);
    let (third, mut third_rx) = session("u3", None);

    hub.register(first).await;
    hub.register(second).await;
    wait_for_active(&hub, 2).await;
    hub.register(third).await;

    // The rejected session's queue is closed by dropping the handle, which
    // is what its writer observes as termination.
    let closed = tokio::time::timeout(Duration::from_secs(1), third_rx.recv())
        .await
        .expect("rejected session's queue must close promptly");
    assert!(closed.is_none(), "queue must be closed, not delivering");

    assert_eq!(hub.stats().active_connections, 2);
}

// ---------------------------------------------------------------------------
// Unregister
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregister_closes_the_queue_and_is_idempotent() {
    let hub = spawn_hub(8);
    let (handle, mut rx) = session("u1", None);
    let session_id = handle.id;
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    hub.unregister("u1", session_id).await;
    wait_for_active(&hub, 0).await;

    let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("queue must close on unregister");
    assert!(closed.is_none());

    // A duplicate unregister must not underflow the counters.
    hub.unregister("u1", session_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.stats().active_connections, 0);
    assert_eq!(hub.stats().unfiltered_connections, 0);
}

#[tokio::test]
async fn unregister_for_unknown_session_is_a_no_op() {
    let hub = spawn_hub(8);
    let (handle, _rx) = session("u1", None);
    hub.register(handle).await;
    wait_for_active(&hub, 1).await;

    hub.unregister("u1", Uuid::new_v4()).await;
    hub.unregister("nobody", Uuid::new_v4()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.stats().active_connections, 1);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_all_workers_and_second_call_no_ops() {
    let hub = spawn_hub(8);
    for (user, filter) in [("u1", None), ("u1", Some("proj_a")), ("u2", None)] {
        let (handle, rx) = session(user, filter);
        spawn_worker(&hub, &handle, rx);
        hub.register(handle).await;
    }
    wait_for_active(&hub, 3).await;

    hub.shutdown(Duration::from_secs(2))
        .await
        .expect("workers unregister on the signal, so shutdown drains");
    assert_eq!(hub.stats().active_connections, 0);

    hub.shutdown(Duration::from_secs(1))
        .await
        .expect("second shutdown must succeed as a no-op");
}

#[tokio::test]
async fn shutdown_times_out_when_a_session_never_exits() {
    let hub = spawn_hub(8);
    // No worker attached: nobody will unregister this session.
    let (stuck, _stuck_rx) = session("u1", None);
    hub.register(stuck).await;
    wait_for_active(&hub, 1).await;

    let err = hub
        .shutdown(Duration::from_millis(100))
        .await
        .expect_err("no worker ever unregisters, so the deadline must expire");
    assert!(matches!(err, ShutdownError::Timeout { remaining: 1 }));
}

#[tokio::test]
async fn registrations_after_shutdown_are_rejected() {
    let hub = spawn_hub(8);
    hub.shutdown(Duration::from_secs(1))
        .await
        .expect("empty hub shuts down immediately");

    let (late, mut late_rx) = session("u1", None);
    hub.register(late).await;

    let closed = tokio::time::timeout(Duration::from_secs(1), late_rx.recv())
        .await
        .expect("late registration's queue must close promptly");
    assert!(closed.is_none());
    assert_eq!(hub.stats().active_connections, 0);
}
