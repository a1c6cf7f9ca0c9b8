use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Close code sent when the upgrade request carries no usable user id.
pub const CLOSE_MISSING_USER: u16 = 4000;
/// Close code sent when a connection stays silent past the idle deadline.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4001;
/// Close code sent when an established connection's user no longer exists.
pub const CLOSE_USER_NOT_FOUND: u16 = 4002;
/// Close code sent to an older connection replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4003;

/// Broker channel bridging external publishers into local delivery.
pub const BROKER_CHANNEL: &str = "ws:notification_queue:";

pub const MAX_INBOUND_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub enum CodecError {
    InvalidJson,
    MissingAction,
    InvalidField(&'static str),
    FrameTooLarge,
    Serialization,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid json frame"),
            Self::MissingAction => write!(f, "frame carries no action"),
            Self::InvalidField(name) => write!(f, "invalid frame field: {}", name),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::Serialization => write!(f, "frame serialization failure"),
        }
    }
}

impl Error for CodecError {}

/// Returns the current instant as epoch milliseconds, the timestamp unit
/// used across all Courier frames and records.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Inbound client frame, dispatched on its `action` field.
///
/// Unknown actions decode successfully so the session layer can log and
/// ignore them without tearing the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Ping,
    Pong,
    GetNotifications,
    SendNotification {
        user_id: String,
        message: String,
        event: Option<String>,
    },
    MarkRead {
        user_id: String,
        notification_id: i64,
    },
    Unknown(String),
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        if text.len() > MAX_INBOUND_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let value: Value = serde_json::from_str(text).map_err(|_| CodecError::InvalidJson)?;
        let map = value.as_object().ok_or(CodecError::InvalidJson)?;
        let action = map
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or(CodecError::MissingAction)?;
        match action {
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "get_notifications" => Ok(Self::GetNotifications),
            "send_notification" => {
                let user_id =
                    opaque_id(map.get("user_id")).ok_or(CodecError::InvalidField("user_id"))?;
                let message = map
                    .get("message")
                    .and_then(|v| v.as_str())
                    .ok_or(CodecError::InvalidField("message"))?
                    .to_string();
                let event = map
                    .get("event")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string());
                Ok(Self::SendNotification {
                    user_id,
                    message,
                    event,
                })
            }
            "mark_read" => {
                let user_id =
                    opaque_id(map.get("user_id")).ok_or(CodecError::InvalidField("user_id"))?;
                let notification_id = map
                    .get("notification_id")
                    .and_then(|v| v.as_i64())
                    .ok_or(CodecError::InvalidField("notification_id"))?;
                Ok(Self::MarkRead {
                    user_id,
                    notification_id,
                })
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

/// Unread-count snapshot pushed after admission and on `get_notifications`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCounts {
    pub system_notifications: i64,
    pub general_notices: i64,
    pub personal_notifications: i64,
    pub announcements: i64,
}

/// Server-to-client frame envelopes, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connection {
        status: String,
        message: String,
        connection_id: u64,
    },
    Pong {
        timestamp: i64,
    },
    NotificationCount {
        data: NotificationCounts,
    },
    Notification {
        event: String,
        message: String,
        count: i64,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn connection_established(connection_id: u64) -> Self {
        Self::Connection {
            status: "connected".to_string(),
            message: "WebSocket connection established".to_string(),
            connection_id,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|_| CodecError::Serialization)
    }
}

/// A notification as stored in the per-user offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: String,
    pub event: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl NotificationRecord {
    pub fn new(user_id: &str, event: &str, message: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            event: event.to_string(),
            message: message.to_string(),
            timestamp: now_millis(),
            id: None,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|_| CodecError::Serialization)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(|_| CodecError::InvalidJson)
    }
}

/// Payload carried on the broker channel: `{"userId": ..., "message": ...}`.
///
/// External publishers send the user id either as a JSON number or as a
/// string; both forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub user_id: String,
    pub message: String,
}

impl ChannelMessage {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text).map_err(|_| CodecError::InvalidJson)?;
        let map = value.as_object().ok_or(CodecError::InvalidJson)?;
        let user_id = opaque_id(map.get("userId")).ok_or(CodecError::InvalidField("userId"))?;
        let message = map
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or(CodecError::InvalidField("message"))?
            .to_string();
        Ok(Self { user_id, message })
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        let rendered = serde_json::json!({
            "userId": self.user_id,
            "message": self.message,
        });
        serde_json::to_string(&rendered).map_err(|_| CodecError::Serialization)
    }
}

fn opaque_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ping() {
        let frame = ClientFrame::decode("{\"action\":\"ping\"}").unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn decode_send_notification_with_numeric_user() {
        let frame = ClientFrame::decode(
            "{\"action\":\"send_notification\",\"user_id\":42,\"message\":\"hi\",\"event\":\"greeting\"}",
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::SendNotification {
                user_id: "42".to_string(),
                message: "hi".to_string(),
                event: Some("greeting".to_string()),
            }
        );
    }

    #[test]
    fn decode_mark_read() {
        let frame = ClientFrame::decode(
            "{\"action\":\"mark_read\",\"user_id\":\"7\",\"notification_id\":19}",
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::MarkRead {
                user_id: "7".to_string(),
                notification_id: 19,
            }
        );
    }

    #[test]
    fn unknown_action_is_tolerated() {
        let frame = ClientFrame::decode("{\"action\":\"subscribe\"}").unwrap();
        assert_eq!(frame, ClientFrame::Unknown("subscribe".to_string()));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            ClientFrame::decode("{not json"),
            Err(CodecError::InvalidJson)
        ));
        assert!(matches!(
            ClientFrame::decode("{\"timestamp\":1}"),
            Err(CodecError::MissingAction)
        ));
    }

    #[test]
    fn server_frame_envelopes() {
        let encoded = ServerFrame::connection_established(5).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "connection");
        assert_eq!(value["status"], "connected");
        assert_eq!(value["connection_id"], 5);

        let encoded = ServerFrame::Pong { timestamp: 1234 }.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["timestamp"], 1234);

        let encoded = ServerFrame::Notification {
            event: "notification".to_string(),
            message: "hello".to_string(),
            count: 3,
            timestamp: 99,
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn notification_record_roundtrip() {
        let record = NotificationRecord::new("9", "notification", "queued-1");
        let decoded = NotificationRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.id.is_none());
    }

    #[test]
    fn channel_message_accepts_numeric_and_string_ids() {
        let decoded = ChannelMessage::decode("{\"userId\":42,\"message\":\"hello\"}").unwrap();
        assert_eq!(decoded.user_id, "42");
        let decoded = ChannelMessage::decode("{\"userId\":\"42\",\"message\":\"hello\"}").unwrap();
        assert_eq!(decoded.user_id, "42");
        assert!(ChannelMessage::decode("{\"message\":\"hello\"}").is_err());
    }

    #[test]
    fn count_snapshot_serializes_all_buckets() {
        let counts = NotificationCounts {
            system_notifications: 1,
            general_notices: 2,
            personal_notifications: 3,
            announcements: 4,
        };
        let encoded = ServerFrame::NotificationCount { data: counts }
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["data"]["system_notifications"], 1);
        assert_eq!(value["data"]["announcements"], 4);
    }
}
