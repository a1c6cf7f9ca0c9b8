use super::{AppState, ConnectionEntry, Outbound, ServerError, Task};
use courier_proto::{
    now_millis, ClientFrame, NotificationCounts, ServerFrame, CLOSE_IDLE_TIMEOUT,
    CLOSE_MISSING_USER, CLOSE_SUPERSEDED, CLOSE_USER_NOT_FOUND,
};
use courier_registry::Binding;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// RFC 6455 protocol-error close, used for undecodable inbound frames.
const CLOSE_PROTOCOL_VIOLATION: u16 = 1002;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

enum FrameOutcome {
    Continue,
    Reply(ServerFrame),
    Close(u16, &'static str),
}

/// Owns one accepted socket from upgrade to teardown: admission, the
/// initial-state frames, offline replay, the inbound/outbound/idle loop,
/// and the idempotent close path.
pub async fn handle_connection<S>(state: Arc<AppState>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let metrics = Arc::clone(&state.metrics);
    let mut query: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        match request.uri().path() {
            "/healthz" => return Err(ErrorResponse::new(Some("ok".to_string()))),
            "/metrics" => return Err(ErrorResponse::new(Some(metrics.encode_prometheus()))),
            _ => {}
        }
        query = request.uri().query().map(|value| value.to_string());
        Ok(response)
    };
    let socket = match accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(peer = %peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut socket_stream) = socket.split();

    let user_id = match parse_user_id(query.as_deref()) {
        Some(user) => user,
        None => {
            debug!(peer = %peer, "userId missing or non-numeric");
            close_with(&mut sink, CLOSE_MISSING_USER, "missing or invalid userId").await;
            return;
        }
    };

    let handle = state.allocate_handle();

    // A predecessor process may have published the same handle number and
    // died before cleaning it up.
    match state.registry.lookup_by_handle(handle).await {
        Ok(Some(stale)) => {
            debug!(handle, stale_user = %stale, "stale handle mapping cleared");
            if let Err(err) = state
                .registry
                .unbind_by_handle(state.server_id(), handle)
                .await
            {
                warn!(handle, error = %err, "stale handle cleanup failed");
            }
        }
        Ok(None) => {}
        Err(err) => warn!(handle, error = %err, "stale handle probe failed"),
    }

    // The new client always wins: any prior connection for the user is
    // closed with 4003 and its binding removed before ours is published.
    match state.registry.lookup_by_user(&user_id).await {
        Ok(Some(prior)) => evict_prior(&state, &user_id, &prior).await,
        Ok(None) => {}
        Err(err) => warn!(user = %user_id, error = %err, "prior binding probe failed"),
    }

    // The local entry must exist before the binding is published, or a
    // delivery racing the bind would see the handle as dead and evict it.
    let (tx, rx) = mpsc::channel::<Outbound>(state.config.outbound_buffer);
    let entry = Arc::new(ConnectionEntry::new(tx, user_id.clone()));
    {
        let mut connections = state.connections.write().await;
        connections.insert(handle, Arc::clone(&entry));
    }

    if let Err(err) = state
        .registry
        .bind(&user_id, state.server_id(), handle)
        .await
    {
        error!(user = %user_id, handle, error = %err, "binding failed");
        {
            let mut connections = state.connections.write().await;
            connections.remove(&handle);
        }
        close_with(&mut sink, CLOSE_MISSING_USER, "registration failed").await;
        return;
    }
    state.metrics.incr_connections();
    info!(user = %user_id, handle, peer = %peer, "connection established");

    run_session(&state, &user_id, handle, &entry, &mut sink, &mut socket_stream, rx).await;

    cleanup_connection(&state, handle).await;
}

async fn run_session<S>(
    state: &Arc<AppState>,
    user_id: &str,
    handle: u64,
    entry: &Arc<ConnectionEntry>,
    sink: &mut WsSink<S>,
    stream: &mut SplitStream<WebSocketStream<S>>,
    mut rx: mpsc::Receiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Initial-state frames go straight to the sink: the ack first, the
    // count snapshot second, and any offline backlog right behind them.
    // Failures short of a dead socket leave the connection live.
    if send_frame(state, sink, ServerFrame::connection_established(handle))
        .await
        .is_err()
    {
        return;
    }
    match notification_snapshot(state, user_id).await {
        Ok(data) => {
            if send_frame(state, sink, ServerFrame::NotificationCount { data })
                .await
                .is_err()
            {
                return;
            }
        }
        Err(err) => warn!(user = %user_id, error = %err, "initial snapshot failed"),
    }
    if replay_offline(state, user_id, sink).await.is_err() {
        return;
    }

    let idle = StdDuration::from_secs(state.config.heartbeat_idle_seconds);
    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(message)) => {
                    entry.touch();
                    deadline.as_mut().reset(TokioInstant::now() + idle);
                    match message {
                        Message::Text(text) => {
                            match handle_frame(state, user_id, &text).await {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Reply(frame) => {
                                    if send_frame(state, sink, frame).await.is_err() {
                                        break;
                                    }
                                }
                                FrameOutcome::Close(code, reason) => {
                                    close_with(sink, code, reason).await;
                                    break;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                    }
                }
                Some(Err(err)) => {
                    debug!(user = %user_id, handle, error = %err, "socket read failed");
                    break;
                }
                None => break,
            },
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if send_frame(state, sink, frame).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    close_with(sink, code, reason).await;
                    break;
                }
                None => break,
            },
            () = deadline.as_mut() => {
                info!(user = %user_id, handle, "idle deadline reached");
                state.metrics.mark_idle_disconnect();
                close_with(sink, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                break;
            }
        }
    }
}

async fn handle_frame(state: &Arc<AppState>, user_id: &str, text: &str) -> FrameOutcome {
    state.metrics.mark_ingress();
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(user = %user_id, error = %err, "protocol violation");
            return FrameOutcome::Close(CLOSE_PROTOCOL_VIOLATION, "protocol violation");
        }
    };
    match frame {
        ClientFrame::Ping => FrameOutcome::Reply(ServerFrame::Pong {
            timestamp: now_millis(),
        }),
        ClientFrame::Pong => FrameOutcome::Continue,
        ClientFrame::GetNotifications => {
            match state.storage.user_exists(user_id).await {
                Ok(false) => {
                    warn!(user = %user_id, "user vanished from persistence");
                    return FrameOutcome::Close(CLOSE_USER_NOT_FOUND, "user not found");
                }
                Ok(true) => {}
                Err(err) => warn!(user = %user_id, error = %err, "user probe failed"),
            }
            match notification_snapshot(state, user_id).await {
                Ok(data) => FrameOutcome::Reply(ServerFrame::NotificationCount { data }),
                Err(err) => {
                    warn!(user = %user_id, error = %err, "snapshot refresh failed");
                    FrameOutcome::Continue
                }
            }
        }
        ClientFrame::SendNotification {
            user_id: target,
            message,
            event,
        } => {
            let task = Task::SendNotification {
                user_id: target,
                message,
                event: event.unwrap_or_else(|| "notification".to_string()),
            };
            if state.tasks.try_send(task).is_err() {
                warn!(user = %user_id, "task queue full; send_notification dropped");
            }
            FrameOutcome::Continue
        }
        ClientFrame::MarkRead {
            user_id: target,
            notification_id,
        } => {
            let task = Task::MarkNotificationRead {
                user_id: target,
                notification_id,
            };
            if state.tasks.try_send(task).is_err() {
                warn!(user = %user_id, "task queue full; mark_read dropped");
            }
            FrameOutcome::Continue
        }
        ClientFrame::Unknown(action) => {
            warn!(user = %user_id, action = %action, "unknown action ignored");
            FrameOutcome::Continue
        }
    }
}

/// Closes and unbinds whatever connection currently holds the user.
async fn evict_prior(state: &Arc<AppState>, user_id: &str, prior: &Binding) {
    if prior.server == state.server_id() {
        let entry = {
            let connections = state.connections.read().await;
            connections.get(&prior.handle).cloned()
        };
        if let Some(entry) = entry {
            if entry.user_id == user_id && entry.is_established() {
                entry.mark_closing();
                state.metrics.mark_supersession();
                info!(user = %user_id, handle = prior.handle, "connection superseded");
                if entry
                    .sender
                    .try_send(Outbound::Close {
                        code: CLOSE_SUPERSEDED,
                        reason: "superseded by new connection",
                    })
                    .is_err()
                {
                    debug!(handle = prior.handle, "supersession close not queued");
                }
            }
        }
    } else {
        state.metrics.mark_supersession();
        info!(user = %user_id, server = %prior.server, handle = prior.handle, "remote binding superseded");
    }
    if let Err(err) = state
        .registry
        .unbind(user_id, &prior.server, prior.handle)
        .await
    {
        warn!(user = %user_id, error = %err, "prior binding removal failed");
    }
}

/// Pushes the drained offline backlog in FIFO order. Err means the socket
/// itself is gone.
async fn replay_offline<S>(
    state: &Arc<AppState>,
    user_id: &str,
    sink: &mut WsSink<S>,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let records = match state.registry.drain_offline(user_id).await {
        Ok(records) => records,
        Err(err) => {
            warn!(user = %user_id, error = %err, "offline drain failed");
            return Ok(());
        }
    };
    if records.is_empty() {
        return Ok(());
    }
    let count = match state.storage.unread_personal_count(user_id).await {
        Ok(count) => count,
        Err(_) => 0,
    };
    info!(user = %user_id, backlog = records.len(), "offline queue replayed");
    for record in records {
        let frame = ServerFrame::Notification {
            event: record.event,
            message: record.message,
            count,
            timestamp: record.timestamp,
        };
        send_frame(state, sink, frame).await?;
    }
    Ok(())
}

async fn notification_snapshot(
    state: &Arc<AppState>,
    user_id: &str,
) -> Result<NotificationCounts, ServerError> {
    let snapshot = state.storage.notification_counts(user_id).await?;
    Ok(NotificationCounts {
        system_notifications: snapshot.system_notifications,
        general_notices: snapshot.general_notices,
        personal_notifications: snapshot.personal_notifications,
        announcements: snapshot.announcements,
    })
}

async fn send_frame<S>(
    state: &Arc<AppState>,
    sink: &mut WsSink<S>,
    frame: ServerFrame,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = match frame.encode() {
        Ok(text) => text,
        Err(err) => {
            error!(error = %err, "frame encode failed");
            return Ok(());
        }
    };
    state.metrics.mark_egress();
    match sink.send(Message::Text(text)).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(error = %err, "socket write failed");
            Err(())
        }
    }
}

async fn close_with<S>(sink: &mut WsSink<S>, code: u16, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(err) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "close frame not sent");
    }
}

/// Idempotent close path: the local entry disappears once, and the
/// registry removal compares before deleting, so a second run for the
/// same handle changes nothing.
async fn cleanup_connection(state: &Arc<AppState>, handle: u64) {
    let entry = {
        let mut connections = state.connections.write().await;
        connections.remove(&handle)
    };
    if let Some(entry) = entry {
        entry.mark_closing();
        state.metrics.decr_connections();
        info!(user = %entry.user_id, handle, "connection closed");
    }
    if let Err(err) = state
        .registry
        .unbind_by_handle(state.server_id(), handle)
        .await
    {
        warn!(handle, error = %err, "binding cleanup failed");
    }
}

/// The upgrade query must carry a numeric `userId`; anything else is
/// rejected with close code 4000.
fn parse_user_id(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "userId" {
                if !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()) {
                    return Some(value.to_string());
                }
                return None;
            }
        }
    }
    None
}
