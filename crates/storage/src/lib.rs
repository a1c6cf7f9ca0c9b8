use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_postgres::{Client, NoTls};
use tracing::warn;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

pub const DEFAULT_READ_POOL_SIZE: usize = 15;
pub const DEFAULT_WRITE_POOL_SIZE: usize = 5;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Busy,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Busy => write!(f, "connection pool exhausted"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

/// A `status='pending'` notification row awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub id: i64,
    pub user_id: String,
    pub event: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Unread/active counters backing the notification-count snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub system_notifications: i64,
    pub personal_notifications: i64,
    pub general_notices: i64,
    pub announcements: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: i64,
    pub title: Option<String>,
    pub message: String,
    pub published_at: DateTime<Utc>,
}

/// Fixed-size client pool. Acquisition never blocks: when every permit is
/// out, the caller gets `StorageError::Busy` and decides what to do.
struct Pool {
    clients: Vec<Client>,
    cursor: AtomicUsize,
    permits: Arc<Semaphore>,
}

struct PoolGuard<'a> {
    client: &'a Client,
    _permit: SemaphorePermit<'a>,
}

impl Pool {
    async fn build(dsn: &str, size: usize) -> Result<Pool, StorageError> {
        let size = size.max(1);
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            let (client, connection) = tokio_postgres::connect(dsn, NoTls)
                .await
                .map_err(|_| StorageError::Postgres)?;
            tokio::spawn(async move {
                if let Err(error) = connection.await {
                    tracing::error!("postgres connection stopped: {}", error);
                }
            });
            clients.push(client);
        }
        Ok(Pool {
            clients,
            cursor: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    fn acquire(&self) -> Result<PoolGuard<'_>, StorageError> {
        let permit = self
            .permits
            .try_acquire()
            .map_err(|_| StorageError::Busy)?;
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Ok(PoolGuard {
            client: &self.clients[index],
            _permit: permit,
        })
    }
}

/// PostgreSQL persistence collaborator. Reads go through a wide pool,
/// writes through a narrow one; a failed read is retried once against the
/// write pool before surfacing.
pub struct Storage {
    read: Pool,
    write: Pool,
}

/// Establishes the read and write pools against PostgreSQL.
pub async fn connect(
    dsn: &str,
    read_pool_size: usize,
    write_pool_size: usize,
) -> Result<Storage, StorageError> {
    let read = Pool::build(dsn, read_pool_size).await?;
    let write = Pool::build(dsn, write_pool_size).await?;
    Ok(Storage { read, write })
}

impl Storage {
    /// Applies bundled migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let guard = self.write.acquire()?;
        guard
            .client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Lightweight probe across both pools.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        for pool in [&self.read, &self.write] {
            let guard = pool.acquire()?;
            guard
                .client
                .simple_query("SELECT 1")
                .await
                .map_err(|_| StorageError::Postgres)?;
        }
        Ok(())
    }

    /// All rows still waiting for delivery, oldest first.
    pub async fn pending_notifications(&self) -> Result<Vec<PendingNotification>, StorageError> {
        match self.pending_notifications_on(&self.read).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(error = %err, "read pool query failed; retrying on write pool");
                self.pending_notifications_on(&self.write).await
            }
        }
    }

    async fn pending_notifications_on(
        &self,
        pool: &Pool,
    ) -> Result<Vec<PendingNotification>, StorageError> {
        let guard = pool.acquire()?;
        let rows = guard
            .client
            .query(
                "SELECT id, COALESCE(user_id, ''), COALESCE(event, 'notification'),
                        COALESCE(message, ''), created_at
                 FROM notifications
                 WHERE status = 'pending'
                 ORDER BY id",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| PendingNotification {
                id: row.get(0),
                user_id: row.get(1),
                event: row.get(2),
                message: row.get(3),
                created_at: row.get(4),
            })
            .collect())
    }

    /// Transitions a row out of the polling set. Applied whether the
    /// delivery went to a live socket or into the offline queue.
    pub async fn mark_notification_sent(&self, id: i64) -> Result<(), StorageError> {
        let guard = self.write.acquire()?;
        guard
            .client
            .execute(
                "UPDATE notifications SET status = 'sent' WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Marks one of the user's notifications as read.
    pub async fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<bool, StorageError> {
        let guard = self.write.acquire()?;
        let updated = guard
            .client
            .execute(
                "UPDATE notifications
                 SET read_status = 'read', read_at = now()
                 WHERE id = $1 AND user_id = $2 AND read_status = 'unread'",
                &[&notification_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(updated > 0)
    }

    /// Inserts a pending notification row (the producer side of the
    /// polling feeder).
    pub async fn insert_notification(
        &self,
        user_id: &str,
        category: &str,
        event: &str,
        message: &str,
    ) -> Result<i64, StorageError> {
        let guard = self.write.acquire()?;
        let row = guard
            .client
            .query_one(
                "INSERT INTO notifications (user_id, category, event, message)
                 VALUES ($1, $2, $3, $4)
                 RETURNING id",
                &[&user_id, &category, &event, &message],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// The three snapshot reads behind the `notification_count` frame.
    pub async fn notification_counts(&self, user_id: &str) -> Result<UnreadSnapshot, StorageError> {
        match self.notification_counts_on(&self.read, user_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(error = %err, "read pool query failed; retrying on write pool");
                self.notification_counts_on(&self.write, user_id).await
            }
        }
    }

    async fn notification_counts_on(
        &self,
        pool: &Pool,
        user_id: &str,
    ) -> Result<UnreadSnapshot, StorageError> {
        let guard = pool.acquire()?;
        let unread = guard
            .client
            .query_one(
                "SELECT COUNT(*) FILTER (WHERE category = 'system'),
                        COUNT(*) FILTER (WHERE category <> 'system')
                 FROM notifications
                 WHERE user_id = $1 AND read_status = 'unread'",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let notices = guard
            .client
            .query_one("SELECT COUNT(*) FROM notices WHERE active", &[])
            .await
            .map_err(|_| StorageError::Postgres)?;
        let announcements = guard
            .client
            .query_one(
                "SELECT COUNT(*) FROM announcements
                 WHERE active AND (expires_at IS NULL OR expires_at > now())",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(UnreadSnapshot {
            system_notifications: unread.get(0),
            personal_notifications: unread.get(1),
            general_notices: notices.get(0),
            announcements: announcements.get(0),
        })
    }

    /// Unread personal-notification count carried on every `notification`
    /// frame. System notifications are excluded.
    pub async fn unread_personal_count(&self, user_id: &str) -> Result<i64, StorageError> {
        match self.unread_personal_count_on(&self.read, user_id).await {
            Ok(count) => Ok(count),
            Err(err) => {
                warn!(error = %err, "read pool query failed; retrying on write pool");
                self.unread_personal_count_on(&self.write, user_id).await
            }
        }
    }

    async fn unread_personal_count_on(
        &self,
        pool: &Pool,
        user_id: &str,
    ) -> Result<i64, StorageError> {
        let guard = pool.acquire()?;
        let row = guard
            .client
            .query_one(
                "SELECT COUNT(*) FROM notifications
                 WHERE user_id = $1 AND read_status = 'unread' AND category <> 'system'",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// Whether the externally-authenticated user id still resolves.
    pub async fn user_exists(&self, user_id: &str) -> Result<bool, StorageError> {
        match self.user_exists_on(&self.read, user_id).await {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(error = %err, "read pool query failed; retrying on write pool");
                self.user_exists_on(&self.write, user_id).await
            }
        }
    }

    async fn user_exists_on(&self, pool: &Pool, user_id: &str) -> Result<bool, StorageError> {
        let guard = pool.acquire()?;
        let row = guard
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM users WHERE user_id = $1)",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// Currently visible announcements, newest first.
    pub async fn active_announcements(&self) -> Result<Vec<Announcement>, StorageError> {
        match self.active_announcements_on(&self.read).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(error = %err, "read pool query failed; retrying on write pool");
                self.active_announcements_on(&self.write).await
            }
        }
    }

    async fn active_announcements_on(&self, pool: &Pool) -> Result<Vec<Announcement>, StorageError> {
        let guard = pool.acquire()?;
        let rows = guard
            .client
            .query(
                "SELECT id, title, message, published_at
                 FROM announcements
                 WHERE active AND (expires_at IS NULL OR expires_at > now())
                 ORDER BY published_at DESC",
                &[],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| Announcement {
                id: row.get(0),
                title: row.get(1),
                message: row.get(2),
                published_at: row.get(3),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS notifications"));
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS notices"));
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS announcements"));
        assert!(INIT_SQL.contains("CREATE TABLE IF NOT EXISTS users"));
        assert!(INIT_SQL.contains("read_status"));
    }

    #[test]
    fn default_pool_sizes_split_read_and_write() {
        assert_eq!(DEFAULT_READ_POOL_SIZE, 15);
        assert_eq!(DEFAULT_WRITE_POOL_SIZE, 5);
    }

    // Exercises the pending -> sent and unread -> read transitions against
    // a live database. Skipped unless COURIER_TEST_PG_DSN is set.
    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("COURIER_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: COURIER_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let storage = connect(&dsn, 2, 1).await?;
        storage.migrate().await?;

        let user = format!("courier-test-{}", std::process::id());
        let id = storage
            .insert_notification(&user, "personal", "notification", "db-note")
            .await?;

        let pending = storage.pending_notifications().await?;
        let row = pending
            .iter()
            .find(|row| row.id == id)
            .expect("inserted row is pending");
        assert_eq!(row.user_id, user);
        assert_eq!(row.message, "db-note");

        storage.mark_notification_sent(id).await?;
        let pending = storage.pending_notifications().await?;
        assert!(pending.iter().all(|row| row.id != id));

        assert_eq!(storage.unread_personal_count(&user).await?, 1);
        let counts = storage.notification_counts(&user).await?;
        assert_eq!(counts.personal_notifications, 1);

        // System notifications show up in the snapshot bucket but never in
        // the personal count.
        let system_id = storage
            .insert_notification(&user, "system", "notification", "maintenance")
            .await?;
        assert_eq!(storage.unread_personal_count(&user).await?, 1);
        let counts = storage.notification_counts(&user).await?;
        assert_eq!(counts.system_notifications, 1);
        storage.mark_notification_sent(system_id).await?;
        assert!(storage.mark_notification_read(&user, system_id).await?);

        assert!(storage.mark_notification_read(&user, id).await?);
        assert!(!storage.mark_notification_read(&user, id).await?);
        assert_eq!(storage.unread_personal_count(&user).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn pool_exhaustion_surfaces_as_busy() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("COURIER_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping pool_exhaustion_surfaces_as_busy: COURIER_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let storage = connect(&dsn, 1, 1).await?;
        let held = storage.read.acquire()?;
        assert!(matches!(storage.read.acquire(), Err(StorageError::Busy)));
        drop(held);
        assert!(storage.read.acquire().is_ok());
        Ok(())
    }
}
