use super::{AppState, Outbound};
use courier_proto::{now_millis, ChannelMessage, NotificationRecord, ServerFrame};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a delivery attempt, as observed by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued,
    Dropped,
}

/// Where the message entered this process. Broker messages fan out to
/// every server, so a binding owned elsewhere means the owning server is
/// already handling the same message; locally produced messages are
/// re-routed onto the broker channel instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Broker,
    Process,
}

/// Delivers a locally produced message to a user: pushed onto the live
/// socket when this process owns it, re-published for the owning server
/// when another one does, queued offline otherwise.
pub async fn deliver(state: &Arc<AppState>, user_id: &str, message: &str, event: &str) -> Delivery {
    deliver_inner(state, user_id, message, event, Origin::Process).await
}

/// Delivery entry point for the broker subscriber.
pub async fn deliver_from_broker(
    state: &Arc<AppState>,
    user_id: &str,
    message: &str,
    event: &str,
) -> Delivery {
    deliver_inner(state, user_id, message, event, Origin::Broker).await
}

async fn deliver_inner(
    state: &Arc<AppState>,
    user_id: &str,
    message: &str,
    event: &str,
    origin: Origin,
) -> Delivery {
    let binding = match state.registry.lookup_by_user(user_id).await {
        Ok(binding) => binding,
        Err(err) => {
            warn!(user = %user_id, error = %err, "binding lookup failed");
            None
        }
    };

    if let Some(binding) = binding {
        if binding.server == state.server_id() {
            if push_local(state, user_id, binding.handle, message, event).await {
                state.metrics.mark_delivered();
                return Delivery::Delivered;
            }
            // The local socket is gone or refused the frame; drop the
            // stale binding before queueing. Remote evictions stay the
            // owning server's responsibility.
            if let Err(err) = state
                .registry
                .unbind_by_handle(state.server_id(), binding.handle)
                .await
            {
                warn!(user = %user_id, handle = binding.handle, error = %err, "stale binding cleanup failed");
            }
        } else {
            match origin {
                Origin::Broker => {
                    // Every server received this publish; the one owning
                    // the binding pushes it.
                    debug!(user = %user_id, server = %binding.server, "binding owned elsewhere");
                    return Delivery::Delivered;
                }
                Origin::Process => {
                    let channel_message = ChannelMessage {
                        user_id: user_id.to_string(),
                        message: message.to_string(),
                    };
                    match state.registry.publish(&channel_message).await {
                        Ok(()) => {
                            state.metrics.mark_delivered();
                            debug!(user = %user_id, server = %binding.server, "re-routed to owning server");
                            return Delivery::Delivered;
                        }
                        Err(err) => {
                            // The user is live elsewhere, so the offline
                            // queue is not a fallback here.
                            state.metrics.mark_dropped();
                            warn!(user = %user_id, error = %err, "broker re-route failed; notification dropped");
                            return Delivery::Dropped;
                        }
                    }
                }
            }
        }
    }

    enqueue_offline(state, user_id, message, event).await
}

/// Attempts to hand the frame to the session task owning the handle.
/// Returns false when the handle is unknown, closing, owned by another
/// user, or its outbound channel is gone.
async fn push_local(
    state: &Arc<AppState>,
    user_id: &str,
    handle: u64,
    message: &str,
    event: &str,
) -> bool {
    let sender = {
        let connections = state.connections.read().await;
        match connections.get(&handle) {
            Some(entry) if entry.user_id == user_id && entry.is_established() => {
                Some(entry.sender.clone())
            }
            _ => None,
        }
    };
    let Some(sender) = sender else {
        return false;
    };
    let count = match state.storage.unread_personal_count(user_id).await {
        Ok(count) => count,
        Err(err) => {
            debug!(user = %user_id, error = %err, "unread count unavailable");
            0
        }
    };
    let frame = ServerFrame::Notification {
        event: event.to_string(),
        message: message.to_string(),
        count,
        timestamp: now_millis(),
    };
    sender.send(Outbound::Frame(frame)).await.is_ok()
}

async fn enqueue_offline(
    state: &Arc<AppState>,
    user_id: &str,
    message: &str,
    event: &str,
) -> Delivery {
    if message.is_empty() {
        state.metrics.mark_dropped();
        debug!(user = %user_id, "empty payload dropped");
        return Delivery::Dropped;
    }
    let record = NotificationRecord::new(user_id, event, message);
    match state.registry.enqueue_offline(user_id, &record).await {
        Ok(()) => {
            state.metrics.mark_queued();
            Delivery::Queued
        }
        Err(err) => {
            state.metrics.mark_dropped();
            warn!(user = %user_id, error = %err, "offline enqueue failed; notification dropped");
            Delivery::Dropped
        }
    }
}
