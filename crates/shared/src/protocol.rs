use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::Username, error::ApiError};

/// Join announcement as received off the wire. Two historical shapes exist:
/// early clients sent a bare username string, current clients send a
/// structured object carrying an optional push token. Both normalize via
/// [`JoinPayload::into_join`] before touching the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinPayload {
    Legacy(String),
    Full {
        username: Username,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        push_token: Option<String>,
    },
}

/// Normalized join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub username: Username,
    pub push_token: Option<String>,
}

impl JoinPayload {
    pub fn into_join(self) -> JoinRequest {
        match self {
            JoinPayload::Legacy(username) => JoinRequest {
                username: Username(username),
                push_token: None,
            },
            JoinPayload::Full {
                username,
                push_token,
            } => JoinRequest {
                username,
                push_token,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Join(JoinPayload),
    SendYo { to: Username },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    YoReceived {
        from: Username,
        timestamp: DateTime<Utc>,
        total_yos: i64,
    },
    YoSent {
        to: Username,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    UserOnline {
        username: Username,
    },
    UserOffline {
        username: Username,
    },
    FriendAdded {
        from: Username,
        timestamp: DateTime<Utc>,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_join_payload_normalizes_to_bare_identity() {
        let payload: JoinPayload = serde_json::from_str(r#""alice""#).expect("parse");
        let join = payload.into_join();
        assert_eq!(join.username, Username::from("alice"));
        assert!(join.push_token.is_none());
    }

    #[test]
    fn structured_join_payload_carries_push_token() {
        let payload: JoinPayload =
            serde_json::from_str(r#"{"username":"bob","push_token":"ExponentPushToken[abc]"}"#)
                .expect("parse");
        let join = payload.into_join();
        assert_eq!(join.username, Username::from("bob"));
        assert_eq!(join.push_token.as_deref(), Some("ExponentPushToken[abc]"));
    }

    #[test]
    fn structured_join_payload_token_is_optional() {
        let payload: JoinPayload =
            serde_json::from_str(r#"{"username":"bob"}"#).expect("parse");
        assert!(payload.into_join().push_token.is_none());
    }

    #[test]
    fn client_request_round_trips_tagged_form() {
        let raw = r#"{"type":"send_yo","payload":{"to":"carol"}}"#;
        let req: ClientRequest = serde_json::from_str(raw).expect("parse");
        let ClientRequest::SendYo { to } = req else {
            panic!("expected send_yo");
        };
        assert_eq!(to, Username::from("carol"));
    }

    #[test]
    fn server_event_omits_absent_reason() {
        let event = ServerEvent::YoSent {
            to: Username::from("bob"),
            success: true,
            reason: None,
        };
        let text = serde_json::to_string(&event).expect("serialize");
        assert!(!text.contains("reason"));
    }
}
