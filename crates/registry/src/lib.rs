use courier_proto::{ChannelMessage, NotificationRecord, BROKER_CHANNEL};
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::warn;

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY_MS: u64 = 200;

/// Default retention for per-user offline queues: 7 days.
pub const OFFLINE_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

const USER_FD_PREFIX: &str = "ws:user_fd:";
const FD_USER_PREFIX: &str = "ws:fd_user_map:";
const USER_SERVER_PREFIX: &str = "ws:user_server:";
const QUEUE_PREFIX: &str = "ws:notification_queue:";
const ACTIVE_USERS_KEY: &str = "ws:active_users";

#[derive(Debug)]
pub enum RegistryError {
    Connection,
    Command,
    Serialization,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection => write!(f, "registry connection failure"),
            Self::Command => write!(f, "registry command failure"),
            Self::Serialization => write!(f, "registry serialization failure"),
        }
    }
}

impl Error for RegistryError {}

impl RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection)
    }
}

impl From<RedisError> for RegistryError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            RegistryError::Connection
        } else {
            RegistryError::Command
        }
    }
}

/// A live association between a user and a socket handle on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub server: String,
    pub handle: u64,
}

/// Authoritative distributed map of user/connection bindings and per-user
/// offline queues, shared by every server instance through Redis.
///
/// The forward mapping `user -> (server, handle)` is realized as two keys
/// (`ws:user_fd:<user>` holding the handle, `ws:user_server:<user>` holding
/// the server identity) so the handle key stays byte-compatible with the
/// external contract. The inverse mapping is `ws:fd_user_map:<handle>`.
/// Mutations touching forward and inverse entries run inside one MULTI.
pub struct Registry {
    client: redis::Client,
    connection: Arc<Mutex<MultiplexedConnection>>,
    offline_ttl: i64,
}

/// Opens the shared registry connection.
pub async fn connect(redis_url: &str, offline_ttl: i64) -> Result<Registry, RegistryError> {
    let client = redis::Client::open(redis_url).map_err(|_| RegistryError::Connection)?;
    let connection = client
        .get_multiplexed_async_connection()
        .await
        .map_err(RegistryError::from)?;
    Ok(Registry {
        client,
        connection: Arc::new(Mutex::new(connection)),
        offline_ttl: offline_ttl.max(1),
    })
}

fn user_fd_key(user: &str) -> String {
    format!("{}{}", USER_FD_PREFIX, user)
}

fn fd_user_key(handle: u64) -> String {
    format!("{}{}", FD_USER_PREFIX, handle)
}

fn user_server_key(user: &str) -> String {
    format!("{}{}", USER_SERVER_PREFIX, user)
}

fn queue_key(user: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, user)
}

impl Registry {
    /// Probes the Redis connection.
    pub async fn readiness(&self) -> Result<(), RegistryError> {
        let mut conn = self.connection.lock().await;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(RegistryError::from)?;
        Ok(())
    }

    /// Opens a dedicated pub/sub connection for the broker subscriber.
    /// The multiplexed connection cannot enter subscribe mode.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub, RegistryError> {
        self.client
            .get_async_pubsub()
            .await
            .map_err(RegistryError::from)
    }

    /// Publishes a broker message onto the shared notification channel.
    pub async fn publish(&self, message: &ChannelMessage) -> Result<(), RegistryError> {
        let payload = message.encode().map_err(|_| RegistryError::Serialization)?;
        let payload = payload.as_str();
        self.with_retry(|| async move {
            let mut conn = self.connection.lock().await;
            redis::cmd("PUBLISH")
                .arg(BROKER_CHANNEL)
                .arg(payload)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(RegistryError::from)
        })
        .await
    }

    /// Atomically installs the binding for a user, evicting any prior
    /// binding in the same MULTI. Returns the prior binding if one existed.
    pub async fn bind(
        &self,
        user: &str,
        server: &str,
        handle: u64,
    ) -> Result<Option<Binding>, RegistryError> {
        self.with_retry(|| self.bind_once(user, server, handle)).await
    }

    async fn bind_once(
        &self,
        user: &str,
        server: &str,
        handle: u64,
    ) -> Result<Option<Binding>, RegistryError> {
        let prior = self.lookup_by_user_once(user).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(previous) = prior.as_ref() {
            pipe.cmd("DEL").arg(fd_user_key(previous.handle)).ignore();
        }
        pipe.cmd("SET")
            .arg(user_fd_key(user))
            .arg(handle.to_string())
            .ignore();
        pipe.cmd("SET")
            .arg(user_server_key(user))
            .arg(server)
            .ignore();
        pipe.cmd("SET").arg(fd_user_key(handle)).arg(user).ignore();
        pipe.cmd("SADD").arg(ACTIVE_USERS_KEY).arg(user).ignore();
        let mut conn = self.connection.lock().await;
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(RegistryError::from)?;
        Ok(prior)
    }

    /// Resolves the live binding for a user, if any.
    pub async fn lookup_by_user(&self, user: &str) -> Result<Option<Binding>, RegistryError> {
        self.with_retry(|| self.lookup_by_user_once(user)).await
    }

    async fn lookup_by_user_once(&self, user: &str) -> Result<Option<Binding>, RegistryError> {
        let mut conn = self.connection.lock().await;
        let (fd, server): (Option<String>, Option<String>) = redis::pipe()
            .cmd("GET")
            .arg(user_fd_key(user))
            .cmd("GET")
            .arg(user_server_key(user))
            .query_async(&mut *conn)
            .await
            .map_err(RegistryError::from)?;
        let (Some(fd), Some(server)) = (fd, server) else {
            return Ok(None);
        };
        let handle = fd.parse::<u64>().map_err(|_| RegistryError::Serialization)?;
        Ok(Some(Binding { server, handle }))
    }

    /// Resolves the user owning a handle, if any.
    pub async fn lookup_by_handle(&self, handle: u64) -> Result<Option<String>, RegistryError> {
        self.with_retry(|| async move {
            let mut conn = self.connection.lock().await;
            let user: Option<String> = redis::cmd("GET")
                .arg(fd_user_key(handle))
                .query_async(&mut *conn)
                .await
                .map_err(RegistryError::from)?;
            Ok(user)
        })
        .await
    }

    /// Removes the binding only while it still matches the given pair.
    /// A late close for a superseded handle leaves the new binding intact.
    /// Returns whether anything was removed.
    pub async fn unbind(
        &self,
        user: &str,
        server: &str,
        handle: u64,
    ) -> Result<bool, RegistryError> {
        self.with_retry(|| self.unbind_once(user, server, handle)).await
    }

    async fn unbind_once(
        &self,
        user: &str,
        server: &str,
        handle: u64,
    ) -> Result<bool, RegistryError> {
        let current = self.lookup_by_user_once(user).await?;
        let matches = current
            .as_ref()
            .map(|binding| binding.server == server && binding.handle == handle)
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(user_fd_key(user)).ignore();
        pipe.cmd("DEL").arg(user_server_key(user)).ignore();
        pipe.cmd("DEL").arg(fd_user_key(handle)).ignore();
        pipe.cmd("SREM").arg(ACTIVE_USERS_KEY).arg(user).ignore();
        let mut conn = self.connection.lock().await;
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(RegistryError::from)?;
        Ok(true)
    }

    /// Close-path cleanup keyed by the handle. Removes the inverse entry
    /// when it is not owned by a live binding elsewhere, and the forward
    /// entries only while they still point at this (server, handle).
    /// Returns the user that owned the handle, if any.
    pub async fn unbind_by_handle(
        &self,
        server: &str,
        handle: u64,
    ) -> Result<Option<String>, RegistryError> {
        self.with_retry(|| self.unbind_by_handle_once(server, handle))
            .await
    }

    async fn unbind_by_handle_once(
        &self,
        server: &str,
        handle: u64,
    ) -> Result<Option<String>, RegistryError> {
        let user = {
            let mut conn = self.connection.lock().await;
            let user: Option<String> = redis::cmd("GET")
                .arg(fd_user_key(handle))
                .query_async(&mut *conn)
                .await
                .map_err(RegistryError::from)?;
            user
        };
        let Some(user) = user else {
            return Ok(None);
        };
        let forward = self.lookup_by_user_once(&user).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        match forward {
            Some(binding) if binding.server == server && binding.handle == handle => {
                pipe.cmd("DEL").arg(fd_user_key(handle)).ignore();
                pipe.cmd("DEL").arg(user_fd_key(&user)).ignore();
                pipe.cmd("DEL").arg(user_server_key(&user)).ignore();
                pipe.cmd("SREM").arg(ACTIVE_USERS_KEY).arg(&user).ignore();
            }
            Some(binding) if binding.handle == handle => {
                // The handle number now belongs to a binding on another
                // server; the inverse entry is theirs to remove.
                return Ok(Some(user));
            }
            _ => {
                pipe.cmd("DEL").arg(fd_user_key(handle)).ignore();
            }
        }
        let mut conn = self.connection.lock().await;
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(RegistryError::from)?;
        Ok(Some(user))
    }

    /// Appends a notification to the user's offline queue and refreshes
    /// its retention window.
    pub async fn enqueue_offline(
        &self,
        user: &str,
        record: &NotificationRecord,
    ) -> Result<(), RegistryError> {
        let payload = record.encode().map_err(|_| RegistryError::Serialization)?;
        let payload = payload.as_str();
        self.with_retry(|| async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("RPUSH").arg(queue_key(user)).arg(payload).ignore();
            pipe.cmd("EXPIRE")
                .arg(queue_key(user))
                .arg(self.offline_ttl)
                .ignore();
            let mut conn = self.connection.lock().await;
            pipe.query_async::<()>(&mut *conn)
                .await
                .map_err(RegistryError::from)
        })
        .await
    }

    /// Takes the entire offline queue for a user in FIFO order. The read
    /// and the delete run in one MULTI so a concurrent enqueue lands in a
    /// fresh queue rather than vanishing.
    pub async fn drain_offline(
        &self,
        user: &str,
    ) -> Result<Vec<NotificationRecord>, RegistryError> {
        let items: Vec<String> = self
            .with_retry(|| async move {
                let mut conn = self.connection.lock().await;
                let (items, _removed): (Vec<String>, i64) = redis::pipe()
                    .atomic()
                    .cmd("LRANGE")
                    .arg(queue_key(user))
                    .arg(0)
                    .arg(-1)
                    .cmd("DEL")
                    .arg(queue_key(user))
                    .query_async(&mut *conn)
                    .await
                    .map_err(RegistryError::from)?;
                Ok(items)
            })
            .await?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match NotificationRecord::decode(&item) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(user = %user, error = %err, "corrupt offline record skipped");
                }
            }
        }
        Ok(records)
    }

    /// Length of the user's offline queue.
    pub async fn offline_len(&self, user: &str) -> Result<i64, RegistryError> {
        self.with_retry(|| async move {
            let mut conn = self.connection.lock().await;
            let len: i64 = redis::cmd("LLEN")
                .arg(queue_key(user))
                .query_async(&mut *conn)
                .await
                .map_err(RegistryError::from)?;
            Ok(len)
        })
        .await
    }

    /// Users currently holding a live binding somewhere in the fleet.
    pub async fn active_users(&self) -> Result<Vec<String>, RegistryError> {
        self.with_retry(|| async move {
            let mut conn = self.connection.lock().await;
            let users: Vec<String> = redis::cmd("SMEMBERS")
                .arg(ACTIVE_USERS_KEY)
                .query_async(&mut *conn)
                .await
                .map_err(RegistryError::from)?;
            Ok(users)
        })
        .await
    }

    /// Retries connection-level failures up to three attempts, 200 ms
    /// apart. Data-shape failures propagate on the first attempt.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, RegistryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %err, "registry operation failed; retrying");
                    sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_matches_contract() {
        assert_eq!(user_fd_key("42"), "ws:user_fd:42");
        assert_eq!(fd_user_key(7), "ws:fd_user_map:7");
        assert_eq!(user_server_key("42"), "ws:user_server:42");
        assert_eq!(queue_key("42"), "ws:notification_queue:42");
    }

    #[test]
    fn io_failures_are_transient() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(RegistryError::from(io).is_transient());
        let parse = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!RegistryError::from(parse).is_transient());
        assert!(!RegistryError::Serialization.is_transient());
    }

    #[test]
    fn offline_ttl_is_seven_days() {
        assert_eq!(OFFLINE_TTL_SECONDS, 604800);
    }

    // Exercises binding invariants against a live Redis. Skipped unless
    // COURIER_TEST_REDIS_URL points at a disposable instance.
    #[tokio::test]
    async fn registry_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let url = match std::env::var("COURIER_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping registry_integration_flow: COURIER_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let registry = connect(&url, OFFLINE_TTL_SECONDS).await?;
        let user = "courier-test-user";
        let server = "localhost:9502";

        // Fresh bind publishes forward and inverse entries that agree.
        registry.unbind_by_handle(server, 1001).await?;
        registry.unbind_by_handle(server, 1002).await?;
        let prior = registry.bind(user, server, 1001).await?;
        assert!(prior.is_none());
        let binding = registry.lookup_by_user(user).await?.expect("binding");
        assert_eq!(binding.handle, 1001);
        assert_eq!(binding.server, server);
        assert_eq!(
            registry.lookup_by_handle(1001).await?.as_deref(),
            Some(user)
        );

        // Supersession evicts the old pair before publishing the new one.
        let prior = registry.bind(user, server, 1002).await?;
        assert_eq!(prior.map(|b| b.handle), Some(1001));
        assert!(registry.lookup_by_handle(1001).await?.is_none());
        assert_eq!(
            registry.lookup_by_handle(1002).await?.as_deref(),
            Some(user)
        );

        // A late close for the superseded handle is a no-op.
        assert!(!registry.unbind(user, server, 1001).await?);
        assert!(registry.lookup_by_user(user).await?.is_some());

        // Offline queue preserves FIFO order and empties on drain.
        registry.drain_offline(user).await?;
        let first = NotificationRecord::new(user, "notification", "queued-1");
        let second = NotificationRecord::new(user, "notification", "queued-2");
        registry.enqueue_offline(user, &first).await?;
        registry.enqueue_offline(user, &second).await?;
        assert_eq!(registry.offline_len(user).await?, 2);
        let drained = registry.drain_offline(user).await?;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "queued-1");
        assert_eq!(drained[1].message, "queued-2");
        assert_eq!(registry.offline_len(user).await?, 0);

        // Close path is idempotent.
        assert_eq!(
            registry.unbind_by_handle(server, 1002).await?.as_deref(),
            Some(user)
        );
        assert!(registry.unbind_by_handle(server, 1002).await?.is_none());
        assert!(registry.lookup_by_user(user).await?.is_none());
        Ok(())
    }
}
