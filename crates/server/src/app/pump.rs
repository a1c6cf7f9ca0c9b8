use super::{dispatcher, AppState, ServerError, Task};
use courier_proto::{ChannelMessage, BROKER_CHANNEL};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY_SECS: u64 = 5;

/// Feeder A: bridges the shared broker channel into local delivery.
/// Subscription loss is absorbed with a 5 s pause and a fresh
/// subscription; the loop never exits.
pub fn spawn_broker_subscriber(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            match subscribe_and_pump(&state).await {
                Ok(()) => warn!("broker subscription ended; resubscribing"),
                Err(err) => warn!(error = %err, "broker subscription failed; resubscribing"),
            }
            sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
        }
    });
}

async fn subscribe_and_pump(state: &Arc<AppState>) -> Result<(), ServerError> {
    let mut pubsub = state.registry.subscriber().await?;
    pubsub
        .subscribe(BROKER_CHANNEL)
        .await
        .map_err(|_| ServerError::Registry)?;
    info!(channel = BROKER_CHANNEL, "broker subscription established");
    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "broker payload unreadable");
                continue;
            }
        };
        state.metrics.mark_broker_message();
        match ChannelMessage::decode(&payload) {
            Ok(decoded) => {
                let outcome = dispatcher::deliver_from_broker(
                    state,
                    &decoded.user_id,
                    &decoded.message,
                    "notification",
                )
                .await;
                debug!(user = %decoded.user_id, outcome = ?outcome, "broker message handled");
            }
            Err(err) => warn!(error = %err, "undecodable broker message skipped"),
        }
    }
    Ok(())
}

/// Feeder B: polls the persistence layer for `status='pending'` rows and
/// hands them to the dispatcher. One instance per process.
pub fn spawn_sql_poller(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(state.config.poll_interval_seconds));
        loop {
            ticker.tick().await;
            if let Err(err) = process_pending_rows(&state).await {
                warn!(error = %err, "pending notification poll failed");
            }
        }
    });
}

/// Reads every pending row, delivers the well-formed ones, and moves them
/// to `sent` whether the payload reached a socket or the offline queue.
/// Rows missing a user or message are skipped, not marked.
pub async fn process_pending_rows(state: &Arc<AppState>) -> Result<(), ServerError> {
    let rows = state.storage.pending_notifications().await?;
    for row in rows {
        if row.user_id.is_empty() || row.message.is_empty() {
            warn!(id = row.id, "pending row missing user or message; skipped");
            continue;
        }
        let outcome = dispatcher::deliver(state, &row.user_id, &row.message, &row.event).await;
        state.metrics.mark_pending_row();
        debug!(id = row.id, user = %row.user_id, outcome = ?outcome, "pending row processed");
        if let Err(err) = state.storage.mark_notification_sent(row.id).await {
            warn!(id = row.id, error = %err, "sent transition failed; row stays pending");
        }
    }
    Ok(())
}

/// Feeder C: the task-worker pool. Workers share one queue; a task is not
/// cancellable once accepted.
pub fn spawn_task_workers(state: Arc<AppState>, receiver: mpsc::Receiver<Task>) {
    let receiver = Arc::new(Mutex::new(receiver));
    for worker in 0..state.config.task_workers {
        let state = Arc::clone(&state);
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move {
            loop {
                let task = {
                    let mut guard = receiver.lock().await;
                    guard.recv().await
                };
                let Some(task) = task else {
                    break;
                };
                state.metrics.mark_task();
                process_task(&state, task).await;
            }
            debug!(worker, "task worker stopped");
        });
    }
}

async fn process_task(state: &Arc<AppState>, task: Task) {
    match task {
        Task::ProcessPendingDbNotifications => {
            if let Err(err) = process_pending_rows(state).await {
                warn!(error = %err, "pending notification task failed");
            }
        }
        Task::ProcessQueuedNotifications { user_ids } => {
            process_queued_notifications(state, user_ids).await;
        }
        Task::SendNotification {
            user_id,
            message,
            event,
        } => {
            let outcome = dispatcher::deliver(state, &user_id, &message, &event).await;
            debug!(user = %user_id, outcome = ?outcome, "notification task processed");
        }
        Task::MarkNotificationRead {
            user_id,
            notification_id,
        } => match state
            .storage
            .mark_notification_read(&user_id, notification_id)
            .await
        {
            Ok(true) => debug!(user = %user_id, notification_id, "notification marked read"),
            Ok(false) => debug!(user = %user_id, notification_id, "notification already read or unknown"),
            Err(err) => warn!(user = %user_id, notification_id, error = %err, "mark read failed"),
        },
    }
}

/// Replays the offline queues of the given users (or of every user with a
/// live binding when none are named) through their local sockets. Users
/// bound to other servers are left to those servers.
async fn process_queued_notifications(state: &Arc<AppState>, user_ids: Vec<String>) {
    let users = if user_ids.is_empty() {
        match state.registry.active_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "active user enumeration failed");
                return;
            }
        }
    } else {
        user_ids
    };
    for user in users {
        let locally_bound = match state.registry.lookup_by_user(&user).await {
            Ok(Some(binding)) => binding.server == state.server_id(),
            Ok(None) => false,
            Err(err) => {
                warn!(user = %user, error = %err, "binding lookup failed");
                false
            }
        };
        if !locally_bound {
            continue;
        }
        match state.registry.drain_offline(&user).await {
            Ok(records) => {
                for record in records {
                    dispatcher::deliver(state, &record.user_id, &record.message, &record.event)
                        .await;
                }
            }
            Err(err) => warn!(user = %user, error = %err, "offline drain failed"),
        }
    }
}
