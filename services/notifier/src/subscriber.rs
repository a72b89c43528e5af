//! Pub/sub subscriber: maintains the pattern subscription on the bus and
//! feeds every received event into the hub's routing entry point.
//!
//! The consumer loop is a single task; per-message errors are logged and
//! swallowed so a malformed publisher cannot tear down the subscription.
//! A dropped transport is retried on a fixed delay up to the configured
//! budget; the shutdown signal preempts every wait.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::SubscriberConfig;
use crate::hub::Hub;

/// The four channel families this service routes.
pub const CHANNEL_PATTERNS: [&str; 4] = [
    "project:*:user:*",
    "campaign:*:user:*",
    "alert:*:user:*",
    "system:*",
];

/// One event off the bus, before any parsing.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Why the consumer loop returned.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpExit {
    ShutdownRequested,
    TransportDropped,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("pub/sub subscription lost; {attempts} reconnect attempts failed")]
    RetriesExhausted { attempts: u32 },
}

/// Open a fresh pub/sub connection subscribed to all four patterns.  The
/// returned handle is confirmed: every `psubscribe` has been acknowledged.
pub async fn open_subscription(
    client: &redis::Client,
) -> Result<redis::aio::PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for pattern in CHANNEL_PATTERNS {
        pubsub.psubscribe(pattern).await?;
    }
    Ok(pubsub)
}

/// Feed bus events into the hub until shutdown is signalled or the stream
/// ends.  Generic over the event source so the loop is testable without a
/// running bus.
pub async fn pump_events<S>(
    events: &mut S,
    hub: &Hub,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit
where
    S: Stream<Item = BusMessage> + Unpin,
{
    if *shutdown.borrow() {
        return PumpExit::ShutdownRequested;
    }
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return PumpExit::ShutdownRequested;
                }
            }
            message = events.next() => {
                match message {
                    None => return PumpExit::TransportDropped,
                    Some(message) => {
                        if let Err(e) = hub.process_message(&message.channel, &message.payload).await {
                            warn!(channel = %message.channel, error = %e, "failed to route bus message");
                        }
                    }
                }
            }
        }
    }
}

pub struct Subscriber {
    client: redis::Client,
    hub: Arc<Hub>,
    config: SubscriberConfig,
    shutdown: watch::Receiver<bool>,
}

impl Subscriber {
    pub fn new(
        client: redis::Client,
        hub: Arc<Hub>,
        config: SubscriberConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            hub,
            config,
            shutdown,
        }
    }

    /// Open the initial subscription.  Called before [`Subscriber::run`] so
    /// a bus that is unreachable at startup is a fatal error, not a retry.
    pub async fn subscribe(&self) -> Result<redis::aio::PubSub, redis::RedisError> {
        open_subscription(&self.client).await
    }

    /// Consume the bus until shutdown, reconnecting on transport drops.
    pub async fn run(self, initial: redis::aio::PubSub) -> Result<(), SubscriberError> {
        let Subscriber {
            client,
            hub,
            config,
            mut shutdown,
        } = self;

        spawn_connection_event_logger(&hub, shutdown.clone());

        let mut pubsub = initial;
        loop {
            info!(patterns = ?CHANNEL_PATTERNS, "pub/sub subscriber listening");
            let exit = {
                let mut stream = Box::pin(pubsub.on_message().map(|msg| BusMessage {
                    channel: msg.get_channel_name().to_owned(),
                    payload: msg.get_payload_bytes().to_vec(),
                }));
                pump_events(&mut stream, &hub, &mut shutdown).await
            };
            match exit {
                PumpExit::ShutdownRequested => {
                    info!("pub/sub subscriber stopped");
                    return Ok(());
                }
                PumpExit::TransportDropped => {
                    // Dropping the old handle closes the dead subscription.
                    match reconnect(&client, &config, &mut shutdown).await? {
                        Some(fresh) => pubsub = fresh,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Attempt to re-open the subscription, sleeping `retry_delay` before each
/// attempt.  Returns `None` when shutdown preempted the reconnect.
async fn reconnect(
    client: &redis::Client,
    config: &SubscriberConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<redis::aio::PubSub>, SubscriberError> {
    for attempt in 1..=config.max_retries {
        if *shutdown.borrow() {
            return Ok(None);
        }
        warn!(
            attempt,
            max_retries = config.max_retries,
            "pub/sub transport lost, retrying after delay"
        );
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(None);
                }
            }
            () = tokio::time::sleep(config.retry_delay) => {}
        }
        match open_subscription(client).await {
            Ok(pubsub) => {
                info!(attempt, "pub/sub subscription re-established");
                return Ok(Some(pubsub));
            }
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
    Err(SubscriberError::RetriesExhausted {
        attempts: config.max_retries,
    })
}

/// Surface register/unregister changes from the hub at debug level.  The
/// `has_others` flag tells whether the user still has at least one session.
fn spawn_connection_event_logger(hub: &Hub, mut shutdown: watch::Receiver<bool>) {
    let mut events = hub.subscribe_connection_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => debug!(
                            user_id = %event.user_id,
                            connected = event.connected,
                            has_others = event.has_others,
                            "connection change"
                        ),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}
