//! Per-session WebSocket frame loop.
//!
//! Each session runs a reader/writer pair over the split socket.  The writer
//! owns the sink — it is the only task that ever writes — and the reader
//! treats inbound frames purely as liveness signal.  When either side stops,
//! the worker unregisters from the hub; the hub responds by closing the
//! outbound queue, which drains the other side.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::WebsocketConfig;
use crate::hub::Hub;

/// Drive one session until the socket closes, the queue closes, a deadline
/// expires, or shutdown is signalled.  Requests unregistration exactly once
/// on the way out; safe for sessions the hub rejected (unregister no-ops).
pub async fn run(
    socket: WebSocket,
    hub: Arc<Hub>,
    session_id: Uuid,
    user_id: String,
    outbound: mpsc::Receiver<String>,
    timings: WebsocketConfig,
    shutdown: watch::Receiver<bool>,
) {
    let (sink, stream) = socket.split();
    let pong_wait = timings.pong_wait;
    let writer = tokio::spawn(write_loop(sink, outbound, timings, shutdown.clone()));

    read_loop(stream, pong_wait, shutdown).await;

    // Reader is done (close, error, deadline, or shutdown).  Unregistering
    // makes the hub drop its queue sender, which unblocks the writer.
    hub.unregister(&user_id, session_id).await;
    let _ = writer.await;
    debug!(session_id = %session_id, user_id = %user_id, "session worker finished");
}

/// Consume inbound frames until the connection ends.  The read deadline is
/// re-armed by every inbound frame; pongs are the expected heartbeat, and
/// client payloads are discarded after counting toward liveness.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    pong_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            frame = tokio::time::timeout(pong_wait, stream.next()) => {
                match frame {
                    Err(_) => {
                        debug!("read deadline expired without a frame");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!(error = %e, "socket read error");
                        break;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Pong(_)))) => trace!("pong received"),
                    // Inbound payloads are liveness only; content is dropped.
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }
}

/// Drain the outbound queue onto the socket, pinging at the configured
/// cadence.  Exactly one task writes to the sink.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    timings: WebsocketConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ping = tokio::time::interval(timings.ping_interval);
    // The first tick completes immediately; skip it so pings start one
    // interval after connect.
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = timed_write(&mut sink, Message::Close(None), timings.write_wait).await;
                    break;
                }
            }
            item = outbound.recv() => {
                match item {
                    Some(first) => {
                        let frame = drain_pending(&mut outbound, first);
                        if timed_write(&mut sink, Message::Text(frame.into()), timings.write_wait)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => {
                        // Queue closed by the hub: the session is over.
                        let _ = timed_write(&mut sink, Message::Close(None), timings.write_wait)
                            .await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if timed_write(&mut sink, Message::Ping(Vec::new().into()), timings.write_wait)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Append every already-queued value to `first`, newline-separated, so one
/// text frame carries the whole backlog.
fn drain_pending(outbound: &mut mpsc::Receiver<String>, first: String) -> String {
    let mut frame = first;
    while let Ok(next) = outbound.try_recv() {
        frame.push('\n');
        frame.push_str(&next);
    }
    frame
}

async fn timed_write(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_wait: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "socket write failed");
            Err(())
        }
        Err(_) => {
            debug!("write deadline expired");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_pending_batches_queued_values_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("first".to_owned()).await.unwrap();
        tx.send("second".to_owned()).await.unwrap();
        tx.send("third".to_owned()).await.unwrap();

        let head = rx.recv().await.unwrap();
        let frame = drain_pending(&mut rx, head);
        assert_eq!(frame, "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn drain_pending_leaves_single_value_untouched() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("only".to_owned()).await.unwrap();

        let head = rx.recv().await.unwrap();
        assert_eq!(drain_pending(&mut rx, head), "only");
    }
}
