pub mod dispatcher;
pub mod pump;
pub mod session;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use chrono::Utc;
use courier_proto::{ServerFrame, CLOSE_IDLE_TIMEOUT};
use courier_registry::{Registry, RegistryError};
use courier_storage::{Storage, StorageError};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, sleep, Instant as TokioInstant};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// RFC 6455 "going away", sent to every live socket during shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Registry,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Registry => write!(f, "registry failure"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(_: StorageError) -> Self {
        ServerError::Storage
    }
}

impl From<RegistryError> for ServerError {
    fn from(_: RegistryError) -> Self {
        ServerError::Registry
    }
}

/// Outbound instruction for a session task, pushed through the
/// per-connection channel so each socket keeps a single writer.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: &'static str },
}

/// Background jobs consumed by the task-worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    ProcessPendingDbNotifications,
    ProcessQueuedNotifications { user_ids: Vec<String> },
    SendNotification {
        user_id: String,
        message: String,
        event: String,
    },
    MarkNotificationRead {
        user_id: String,
        notification_id: i64,
    },
}

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<Outbound>,
    pub user_id: String,
    established: AtomicBool,
    last_activity: AtomicI64,
}

impl ConnectionEntry {
    pub fn new(sender: mpsc::Sender<Outbound>, user_id: String) -> Self {
        ConnectionEntry {
            sender,
            user_id,
            established: AtomicBool::new(true),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub fn mark_closing(&self) {
        self.established.store(false, Ordering::SeqCst);
    }

    pub fn idle_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity.load(Ordering::SeqCst)
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub connections: RwLock<HashMap<u64, Arc<ConnectionEntry>>>,
    pub tasks: mpsc::Sender<Task>,
    next_handle: AtomicU64,
}

impl AppState {
    /// The `hostname:port` identity paired with every handle this process
    /// publishes into the registry.
    pub fn server_id(&self) -> &str {
        &self.config.identity
    }

    /// Handles start at 1 and are never reused within a process lifetime.
    pub fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

/// Builds the shared state and spawns the background loops: the three
/// pump feeders and the idle reaper.
pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
    if config.redis_cluster {
        warn!("redis cluster flag set; connecting to the configured endpoint directly");
    }
    let storage = Arc::new(
        courier_storage::connect(&config.postgres_dsn, config.db_read_pool, config.db_write_pool)
            .await?,
    );
    storage.migrate().await?;
    let registry = Arc::new(
        courier_registry::connect(&config.redis_url, config.offline_ttl_seconds).await?,
    );
    registry.readiness().await?;
    let metrics = Arc::new(Metrics::new());
    let (task_tx, task_rx) = mpsc::channel(1024);
    let state = Arc::new(AppState {
        storage,
        registry,
        metrics,
        connections: RwLock::new(HashMap::new()),
        tasks: task_tx,
        next_handle: AtomicU64::new(1),
        config,
    });
    pump::spawn_broker_subscriber(Arc::clone(&state));
    pump::spawn_sql_poller(Arc::clone(&state));
    pump::spawn_task_workers(Arc::clone(&state), task_rx);
    spawn_reaper(Arc::clone(&state));
    Ok(state)
}

/// Transport-level second line of defence behind the per-session idle
/// deadline: sweeps connections whose last activity is older than the
/// heartbeat idle window and asks their sessions to close with 4001.
fn spawn_reaper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(StdDuration::from_secs(state.config.heartbeat_check_seconds));
        loop {
            ticker.tick().await;
            let idle_limit = state.config.heartbeat_idle_seconds as i64;
            let stale: Vec<(u64, Arc<ConnectionEntry>)> = {
                let connections = state.connections.read().await;
                connections
                    .iter()
                    .filter(|(_, entry)| entry.is_established() && entry.idle_seconds() > idle_limit)
                    .map(|(handle, entry)| (*handle, Arc::clone(entry)))
                    .collect()
            };
            for (handle, entry) in stale {
                warn!(handle, user = %entry.user_id, "stale connection reaped");
                entry.mark_closing();
                state.metrics.mark_idle_disconnect();
                if entry
                    .sender
                    .try_send(Outbound::Close {
                        code: CLOSE_IDLE_TIMEOUT,
                        reason: "idle timeout",
                    })
                    .is_err()
                {
                    debug!(handle, "reap close not queued; session already draining");
                }
            }
            debug!(
                connections = state.metrics.connections_active(),
                "connection sweep complete"
            );
        }
    });
}

/// Binds the configured listener and serves until the process exits.
pub async fn serve(state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&state.config.bind)
        .await
        .map_err(|_| ServerError::Io)?;
    serve_with(state, listener).await
}

pub async fn serve_with(state: Arc<AppState>, listener: TcpListener) -> Result<(), ServerError> {
    let acceptor = tls_acceptor(&state.config);
    info!(
        address = %state.config.bind,
        identity = %state.config.identity,
        tls = acceptor.is_some(),
        "courier listening"
    );
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let open = state.connections.read().await.len();
        if open >= state.config.max_connections {
            warn!(peer = %peer, open, "connection limit reached; refusing socket");
            continue;
        }
        tune_socket(&stream, &state.config);
        let state = Arc::clone(&state);
        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => session::handle_connection(state, tls_stream, peer).await,
                        Err(err) => debug!(peer = %peer, error = %err, "tls handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(session::handle_connection(state, stream, peer));
            }
        }
    }
}

/// Long-lived idle sockets benefit from explicit buffer sizing and
/// TCP-level keepalive probes below the application heartbeat.
fn tune_socket(stream: &tokio::net::TcpStream, config: &ServerConfig) {
    let socket = socket2::SockRef::from(stream);
    if let Err(err) = socket.set_send_buffer_size(config.socket_send_buffer) {
        debug!(error = %err, "send buffer sizing failed");
    }
    if let Err(err) = socket.set_recv_buffer_size(config.socket_recv_buffer) {
        debug!(error = %err, "recv buffer sizing failed");
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(StdDuration::from_secs(config.heartbeat_idle_seconds))
        .with_interval(StdDuration::from_secs(config.heartbeat_check_seconds));
    if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
        debug!(error = %err, "tcp keepalive setup failed");
    }
    if let Err(err) = socket.set_nodelay(true) {
        debug!(error = %err, "nodelay setup failed");
    }
}

/// Asks every live session to close and waits for them to drain, so the
/// registry is clean before the process exits. Sessions unbind themselves
/// on the way out; a client reconnecting later starts from a fresh bind.
pub async fn shutdown(state: &Arc<AppState>) {
    let entries: Vec<Arc<ConnectionEntry>> = {
        let connections = state.connections.read().await;
        connections.values().cloned().collect()
    };
    info!(connections = entries.len(), "draining connections");
    for entry in &entries {
        entry.mark_closing();
        if entry
            .sender
            .try_send(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down",
            })
            .is_err()
        {
            debug!(user = %entry.user_id, "shutdown close not queued");
        }
    }
    let deadline = TokioInstant::now() + StdDuration::from_secs(5);
    while state.metrics.connections_active() > 0 && TokioInstant::now() < deadline {
        sleep(StdDuration::from_millis(100)).await;
    }
    info!(
        remaining = state.metrics.connections_active(),
        "shutdown complete"
    );
}

/// TLS is opportunistic: configured cert and key files that exist and
/// parse yield an acceptor, anything else falls back to plaintext.
fn tls_acceptor(config: &ServerConfig) -> Option<TlsAcceptor> {
    let (cert_path, key_path) = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return None,
    };
    let certs = match File::open(cert_path) {
        Ok(file) => {
            let mut reader = BufReader::new(file);
            match rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>() {
                Ok(certs) if !certs.is_empty() => certs,
                _ => {
                    warn!(path = %cert_path, "tls certificate unreadable; serving plaintext");
                    return None;
                }
            }
        }
        Err(err) => {
            warn!(path = %cert_path, error = %err, "tls certificate unreadable; serving plaintext");
            return None;
        }
    };
    let key = match File::open(key_path) {
        Ok(file) => {
            let mut reader = BufReader::new(file);
            match rustls_pemfile::private_key(&mut reader) {
                Ok(Some(key)) => key,
                _ => {
                    warn!(path = %key_path, "tls key unreadable; serving plaintext");
                    return None;
                }
            }
        }
        Err(err) => {
            warn!(path = %key_path, error = %err, "tls key unreadable; serving plaintext");
            return None;
        }
    };
    match TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
    {
        Ok(tls_config) => Some(TlsAcceptor::from(Arc::new(tls_config))),
        Err(err) => {
            error!(error = %err, "tls configuration rejected; serving plaintext");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_proto::{ChannelMessage, NotificationRecord};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::Message;

    fn test_config(redis_url: String, postgres_dsn: String) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            identity: format!("courier-test:{}", std::process::id()),
            tls_cert: None,
            tls_key: None,
            postgres_dsn,
            redis_url,
            redis_cluster: false,
            db_read_pool: 2,
            db_write_pool: 1,
            worker_threads: 2,
            task_workers: 2,
            max_connections: 16,
            outbound_buffer: 32,
            socket_send_buffer: 256 * 1024,
            socket_recv_buffer: 256 * 1024,
            heartbeat_idle_seconds: 180,
            heartbeat_check_seconds: 60,
            poll_interval_seconds: 60,
            offline_ttl_seconds: 604800,
        }
    }

    async fn next_json(
        socket: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
    ) -> Value {
        loop {
            let message = timeout(StdDuration::from_secs(2), socket.next())
                .await
                .expect("frame within deadline")
                .expect("socket open")
                .expect("frame readable");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    async fn await_notification(
        socket: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        expected: &str,
    ) -> Value {
        loop {
            let value = next_json(socket).await;
            if value["type"] == "notification" && value["message"] == expected {
                return value;
            }
        }
    }

    // Drives the full delivery core against live Redis and PostgreSQL:
    // admission frames, ping round-trip, broker delivery while online,
    // supersession, and offline queue drain on reconnect. Skipped unless
    // both COURIER_TEST_REDIS_URL and COURIER_TEST_PG_DSN are set.
    #[tokio::test]
    async fn end_to_end_delivery_flow() -> Result<(), Box<dyn Error>> {
        let (redis_url, pg_dsn) = match (
            std::env::var("COURIER_TEST_REDIS_URL"),
            std::env::var("COURIER_TEST_PG_DSN"),
        ) {
            (Ok(redis), Ok(pg)) => (redis, pg),
            _ => {
                eprintln!("skipping end_to_end_delivery_flow: test backends not configured");
                return Ok(());
            }
        };
        let user = "904213";
        let state = init(test_config(redis_url, pg_dsn)).await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve_with(Arc::clone(&state), listener));
        // Give the broker subscription a moment to establish.
        sleep(StdDuration::from_millis(300)).await;

        state.registry.drain_offline(user).await?;
        let url = format!("ws://{}/?userId={}", addr, user);

        // Admission pushes the connection ack, then the count snapshot.
        let (mut first, _) = tokio_tungstenite::connect_async(&url).await?;
        let ack = next_json(&mut first).await;
        assert_eq!(ack["type"], "connection");
        assert_eq!(ack["status"], "connected");
        let counts = next_json(&mut first).await;
        assert_eq!(counts["type"], "notification_count");

        // Ping round-trip.
        first
            .send(Message::Text("{\"action\":\"ping\"}".to_string()))
            .await?;
        let pong = next_json(&mut first).await;
        assert_eq!(pong["type"], "pong");

        // Broker publish reaches the live socket; nothing is queued.
        state
            .registry
            .publish(&ChannelMessage {
                user_id: user.to_string(),
                message: "hello".to_string(),
            })
            .await?;
        let delivered = await_notification(&mut first, "hello").await;
        assert_eq!(delivered["type"], "notification");
        assert_eq!(state.registry.offline_len(user).await?, 0);

        // The send_notification action round-trips through the task queue.
        first
            .send(Message::Text(format!(
                "{{\"action\":\"send_notification\",\"user_id\":{},\"message\":\"self-note\"}}",
                user
            )))
            .await?;
        await_notification(&mut first, "self-note").await;

        // The queued-notifications task replays the offline queue onto the
        // live socket.
        state
            .registry
            .enqueue_offline(user, &NotificationRecord::new(user, "notification", "task-drain"))
            .await?;
        state
            .tasks
            .send(Task::ProcessQueuedNotifications {
                user_ids: vec![user.to_string()],
            })
            .await?;
        await_notification(&mut first, "task-drain").await;

        // A pending row is delivered and transitioned by the polling body,
        // then marked read through the mark_read action.
        let baseline = state.storage.unread_personal_count(user).await?;
        let row_id = state
            .storage
            .insert_notification(user, "personal", "notification", "db-note")
            .await?;
        state.tasks.send(Task::ProcessPendingDbNotifications).await?;
        await_notification(&mut first, "db-note").await;
        assert_eq!(
            state.storage.unread_personal_count(user).await?,
            baseline + 1
        );
        first
            .send(Message::Text(format!(
                "{{\"action\":\"mark_read\",\"user_id\":{},\"notification_id\":{}}}",
                user, row_id
            )))
            .await?;
        sleep(StdDuration::from_millis(500)).await;
        assert_eq!(state.storage.unread_personal_count(user).await?, baseline);

        // A second connection for the same user supersedes the first.
        let (mut second, _) = tokio_tungstenite::connect_async(&url).await?;
        let ack = next_json(&mut second).await;
        assert_eq!(ack["type"], "connection");
        let _ = next_json(&mut second).await;
        let closed = timeout(StdDuration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        })
        .await
        .expect("close within deadline");
        let frame = closed.expect("close frame with code");
        assert_eq!(u16::from(frame.code), courier_proto::CLOSE_SUPERSEDED);

        // Publishes while offline accumulate in FIFO order, then drain on
        // the next connection.
        second.close(None).await?;
        sleep(StdDuration::from_millis(500)).await;
        for message in ["queued-1", "queued-2"] {
            state
                .registry
                .publish(&ChannelMessage {
                    user_id: user.to_string(),
                    message: message.to_string(),
                })
                .await?;
        }
        sleep(StdDuration::from_millis(500)).await;
        assert_eq!(state.registry.offline_len(user).await?, 2);

        let (mut third, _) = tokio_tungstenite::connect_async(&url).await?;
        let ack = next_json(&mut third).await;
        assert_eq!(ack["type"], "connection");
        let _ = next_json(&mut third).await;
        let replay = next_json(&mut third).await;
        assert_eq!(replay["type"], "notification");
        assert_eq!(replay["message"], "queued-1");
        let replay = next_json(&mut third).await;
        assert_eq!(replay["message"], "queued-2");
        assert_eq!(state.registry.offline_len(user).await?, 0);

        third.close(None).await?;
        Ok(())
    }
}
