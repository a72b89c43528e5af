//! Connection hub: the authoritative registry of live sessions and the
//! routing entry point for bus messages.
//!
//! Structural mutation (register/unregister) is sequenced through a single
//! loop fed by bounded intake channels; dispatches run concurrently and only
//! take the read side of the index lock, long enough to copy one user's
//! session set.  Per-session outbound queues have exactly one producer (the
//! hub) and one consumer (the session's writer task); the hub closes a queue
//! by dropping its sender — at unregister, at shutdown, or when a
//! registration is rejected — and the writer never does.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use notify_protocol::{
    ChannelRoute, MessageKind, NotificationPayload, ProtocolError, detect_message_kind,
    parse_channel, transform,
};

use crate::webhook::AlertDispatcher;

/// Capacity of each per-session outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the register/unregister intake channels; sized to absorb
/// connection bursts without suspending upgrade handlers.
const INTAKE_CAPACITY: usize = 128;

const CONNECTION_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// The hub's view of one live session.
///
/// Holds the ONLY permanent sender for the session's outbound queue; clones
/// made while copying a user's set for dispatch are transient.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: String,
    /// Project filter; `None` matches every project/campaign event for the
    /// session's user.
    pub project_filter: Option<String>,
    pub outbound: mpsc::Sender<String>,
}

impl SessionHandle {
    fn matches_entity(&self, entity_id: &str) -> bool {
        self.project_filter
            .as_deref()
            .is_none_or(|filter| filter == entity_id)
    }
}

struct Unregister {
    user_id: String,
    session_id: Uuid,
}

/// Emitted on every register/unregister; `has_others` tells the consumer
/// whether any sessions remain for the user after the change.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub user_id: String,
    pub connected: bool,
    pub has_others: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Payload typed successfully but failed to deserialize into its shape.
    #[error("message transform failed: {0}")]
    Transform(ProtocolError),
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{remaining} sessions still active at shutdown deadline")]
    Timeout { remaining: usize },
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    filtered: AtomicUsize,
    unfiltered: AtomicUsize,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    inputs_dropped: AtomicU64,
    sent_data_onboarding: AtomicU64,
    sent_analytics_pipeline: AtomicU64,
    sent_crisis_alert: AtomicU64,
    sent_campaign_event: AtomicU64,
    sent_system: AtomicU64,
}

impl Counters {
    fn record_kind(&self, kind: MessageKind) {
        let counter = match kind {
            MessageKind::DataOnboarding => &self.sent_data_onboarding,
            MessageKind::AnalyticsPipeline => &self.sent_analytics_pipeline,
            MessageKind::CrisisAlert => &self.sent_crisis_alert,
            MessageKind::CampaignEvent => &self.sent_campaign_event,
            MessageKind::System => &self.sent_system,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of the hub counters.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub active_connections: usize,
    pub filtered_connections: usize,
    pub unfiltered_connections: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub inputs_dropped: u64,
    pub sent_by_kind: KindCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindCounts {
    pub data_onboarding: u64,
    pub analytics_pipeline: u64,
    pub crisis_alert: u64,
    pub campaign_event: u64,
    pub system: u64,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

type SessionIndex = HashMap<String, HashMap<Uuid, SessionHandle>>;

type IntakeReceivers = (mpsc::Receiver<SessionHandle>, mpsc::Receiver<Unregister>);

pub struct Hub {
    sessions: RwLock<SessionIndex>,
    counters: Counters,
    max_connections: usize,
    register_tx: mpsc::Sender<SessionHandle>,
    unregister_tx: mpsc::Sender<Unregister>,
    /// Taken exactly once by [`Hub::run`].
    intake: Mutex<Option<IntakeReceivers>>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    drained: Notify,
    alerts: AlertDispatcher,
}

impl Hub {
    pub fn new(max_connections: usize, alerts: AlertDispatcher) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (connection_tx, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Hub {
            sessions: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            max_connections,
            register_tx,
            unregister_tx,
            intake: Mutex::new(Some((register_rx, unregister_rx))),
            connection_tx,
            shutdown_tx,
            drained: Notify::new(),
            alerts,
        })
    }

    /// The serialization loop for structural mutation.  Runs until shutdown
    /// has been signalled and the registry has drained.
    pub async fn run(self: Arc<Self>) {
        let Some((mut register_rx, mut unregister_rx)) = self.intake.lock().await.take() else {
            warn!("hub loop already running");
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                Some(handle) = register_rx.recv() => self.insert_session(handle).await,
                Some(unreg) = unregister_rx.recv() => self.remove_session(&unreg).await,
                else => break,
            }
            if *shutdown.borrow() && self.counters.active.load(Ordering::Acquire) == 0 {
                break;
            }
        }
        debug!("hub loop stopped");
    }

    // -----------------------------------------------------------------------
    // Registration intake
    // -----------------------------------------------------------------------

    /// Submit a session for registration.  The hub loop either inserts it or
    /// rejects it by dropping the handle, which closes the outbound queue and
    /// unblocks the session's writer.
    pub async fn register(&self, handle: SessionHandle) {
        if self.register_tx.send(handle).await.is_err() {
            debug!("register submitted after hub loop exit");
        }
    }

    /// Request removal of a session.  Safe to call for sessions that were
    /// never inserted (rejected registrations) or were already removed.
    pub async fn unregister(&self, user_id: &str, session_id: Uuid) {
        let unreg = Unregister {
            user_id: user_id.to_owned(),
            session_id,
        };
        if self.unregister_tx.send(unreg).await.is_err() {
            debug!("unregister submitted after hub loop exit");
        }
    }

    /// Cheap capacity probe used by the upgrade handler to answer 503 before
    /// upgrading.  The hub loop re-checks at insert time.
    pub fn at_capacity(&self) -> bool {
        self.counters.active.load(Ordering::Acquire) >= self.max_connections
    }

    async fn insert_session(&self, handle: SessionHandle) {
        if *self.shutdown_tx.borrow() {
            info!(user_id = %handle.user_id, "connection rejected: hub shutting down");
            return;
        }
        if self.counters.active.load(Ordering::Acquire) >= self.max_connections {
            warn!(
                user_id = %handle.user_id,
                max_connections = self.max_connections,
                "connection rejected: at capacity"
            );
            return;
        }

        let session_id = handle.id;
        let user_id = handle.user_id.clone();
        let filtered = handle.project_filter.is_some();

        let has_others = {
            let mut sessions = self.sessions.write().await;
            let user_sessions = sessions.entry(user_id.clone()).or_default();
            let had_others = !user_sessions.is_empty();
            user_sessions.insert(session_id, handle);
            had_others
        };

        self.counters.active.fetch_add(1, Ordering::AcqRel);
        if filtered {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.unfiltered.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.connection_tx.send(ConnectionEvent {
            user_id: user_id.clone(),
            connected: true,
            has_others,
        });
        info!(
            session_id = %session_id,
            user_id = %user_id,
            filtered,
            active = self.counters.active.load(Ordering::Acquire),
            "session registered"
        );
    }

    async fn remove_session(&self, unreg: &Unregister) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let Some(user_sessions) = sessions.get_mut(&unreg.user_id) else {
                return;
            };
            let Some(handle) = user_sessions.remove(&unreg.session_id) else {
                return;
            };
            if user_sessions.is_empty() {
                sessions.remove(&unreg.user_id);
            }
            handle
        };
        // Dropping the handle here drops the hub's sender: the one and only
        // close of this session's outbound queue.
        let filtered = removed.project_filter.is_some();
        drop(removed);

        self.counters.active.fetch_sub(1, Ordering::AcqRel);
        if filtered {
            self.counters.filtered.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.counters.unfiltered.fetch_sub(1, Ordering::Relaxed);
        }
        self.drained.notify_waiters();

        let has_others = self
            .sessions
            .read()
            .await
            .get(&unreg.user_id)
            .is_some_and(|s| !s.is_empty());
        let _ = self.connection_tx.send(ConnectionEvent {
            user_id: unreg.user_id.clone(),
            connected: false,
            has_others,
        });
        info!(
            session_id = %unreg.session_id,
            user_id = %unreg.user_id,
            has_others,
            active = self.counters.active.load(Ordering::Acquire),
            "session unregistered"
        );
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Enqueue `payload` to every session of `user_id`.  Never blocks: a
    /// full queue drops the message for that session only.
    pub async fn dispatch_to_user(&self, user_id: &str, payload: &str) {
        for handle in self.user_sessions(user_id).await {
            self.enqueue(&handle, payload);
        }
    }

    /// Like [`Hub::dispatch_to_user`] but skips sessions whose filter does
    /// not match `entity_id`.
    pub async fn dispatch_to_user_filtered(&self, user_id: &str, entity_id: &str, payload: &str) {
        for handle in self.user_sessions(user_id).await {
            if handle.matches_entity(entity_id) {
                self.enqueue(&handle, payload);
            }
        }
    }

    /// Enqueue `payload` to every live session.
    pub async fn broadcast(&self, payload: &str) {
        let targets: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .flat_map(|user_sessions| user_sessions.values().cloned())
                .collect()
        };
        for handle in &targets {
            self.enqueue(handle, payload);
        }
    }

    /// Copy one user's session set under the read lock.
    async fn user_sessions(&self, user_id: &str) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(user_id)
            .map(|user_sessions| user_sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, handle: &SessionHandle, payload: &str) {
        match handle.outbound.try_send(payload.to_owned()) {
            Ok(()) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    session_id = %handle.id,
                    user_id = %handle.user_id,
                    "outbound queue full, dropping message"
                );
                self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Session is draining; the unregister is already in flight.
                debug!(session_id = %handle.id, "outbound queue closed, dropping message");
                self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing entry point
    // -----------------------------------------------------------------------

    /// Route one bus message: parse the channel, type the payload, transform
    /// it into an envelope, hand crisis alerts to the webhook dispatcher, and
    /// enqueue the serialized envelope to every entitled session.
    ///
    /// Unroutable channels and unclassifiable payloads are dropped with a
    /// warning; a payload that types but fails to deserialize propagates as
    /// [`RouteError::Transform`].
    pub async fn process_message(&self, channel: &str, payload: &[u8]) -> Result<(), RouteError> {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let route = match parse_channel(channel) {
            Ok(route) => route,
            Err(e) => {
                warn!(channel = %channel, error = %e, "dropping message on unroutable channel");
                self.counters.inputs_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        let kind = match detect_message_kind(payload) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(channel = %channel, error = %e, "dropping message of unknown kind");
                self.counters.inputs_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        let notification = transform(kind, payload).map_err(RouteError::Transform)?;

        if let NotificationPayload::CrisisAlert(alert) = &notification.payload {
            self.alerts.dispatch(alert.clone(), notification.timestamp);
        }

        let bytes = serde_json::to_string(&notification)?;
        self.counters.record_kind(kind);

        match &route {
            ChannelRoute::Project {
                project_id,
                user_id,
            } => {
                self.dispatch_to_user_filtered(user_id, project_id, &bytes)
                    .await;
            }
            ChannelRoute::Campaign {
                campaign_id,
                user_id,
            } => {
                self.dispatch_to_user_filtered(user_id, campaign_id, &bytes)
                    .await;
            }
            ChannelRoute::Alert { user_id, .. } => self.dispatch_to_user(user_id, &bytes).await,
            ChannelRoute::System { .. } => self.broadcast(&bytes).await,
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.counters.active.load(Ordering::Acquire),
            filtered_connections: self.counters.filtered.load(Ordering::Relaxed),
            unfiltered_connections: self.counters.unfiltered.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.counters.messages_failed.load(Ordering::Relaxed),
            inputs_dropped: self.counters.inputs_dropped.load(Ordering::Relaxed),
            sent_by_kind: KindCounts {
                data_onboarding: self.counters.sent_data_onboarding.load(Ordering::Relaxed),
                analytics_pipeline: self
                    .counters
                    .sent_analytics_pipeline
                    .load(Ordering::Relaxed),
                crisis_alert: self.counters.sent_crisis_alert.load(Ordering::Relaxed),
                campaign_event: self.counters.sent_campaign_event.load(Ordering::Relaxed),
                system: self.counters.sent_system.load(Ordering::Relaxed),
            },
        }
    }

    /// Subscribe to register/unregister events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    /// A receiver that flips to `true` when shutdown begins.  Session workers
    /// and the subscriber select on this.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Signal every live session to close and wait for the registry to
    /// drain.  Each session worker tears down on the signal and unregisters;
    /// the hub loop closes its queue on removal.  Calling this again after a
    /// successful shutdown returns `Ok` immediately.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.shutdown_tx.send_replace(true);
        let active = self.counters.active.load(Ordering::Acquire);
        if active > 0 {
            info!(active, "hub shutting down, waiting for sessions to drain");
        }
        tokio::time::timeout(deadline, self.wait_drained())
            .await
            .map_err(|_| ShutdownError::Timeout {
                remaining: self.counters.active.load(Ordering::Acquire),
            })
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.counters.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user_id: &str, filter: Option<&str>) -> (SessionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            project_filter: filter.map(ToOwned::to_owned),
            outbound: tx,
        };
        (handle, rx)
    }

    #[test]
    fn filter_matching_treats_none_as_match_all() {
        let (unfiltered, _rx) = handle("u1", None);
        assert!(unfiltered.matches_entity("proj_a"));
        assert!(unfiltered.matches_entity("proj_b"));

        let (filtered, _rx) = handle("u1", Some("proj_a"));
        assert!(filtered.matches_entity("proj_a"));
        assert!(!filtered.matches_entity("proj_b"));
    }

    #[tokio::test]
    async fn enqueue_counts_full_queue_as_failed_without_blocking() {
        let hub = Hub::new(8, AlertDispatcher::disabled());
        let (tx, mut rx) = mpsc::channel(1);
        let target = SessionHandle {
            id: Uuid::new_v4(),
            user_id: "u1".to_owned(),
            project_filter: None,
            outbound: tx,
        };

        hub.enqueue(&target, "first");
        hub.enqueue(&target, "overflow");

        let stats = hub.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert!(rx.try_recv().is_err(), "overflow must have been dropped");
    }
}
