//! Messages exchanged between views (extension popup, content scripts,
//! dashboard, this process). The same type doubles as the notifier signal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ApplicationStats, NewApplication};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    /// Push the cached stats of the signed-in user.
    SyncStats,
    #[serde(rename_all = "camelCase")]
    GetStats {
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateStats {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        stats: Option<Value>,
    },
    RefreshStats,
    UserLoggedIn,
    UserLoggedOut,
    TrackApplication {
        application: NewApplication,
    },
    RemoveApplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Outcome {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<ApplicationStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// The local change is applied but the remote write is still queued.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pending: bool,
    },
    Status {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Status {
            status: Status::Success,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Status {
            status: Status::Error,
            message: Some(message.into()),
        }
    }

    pub fn stats(stats: ApplicationStats, pending: bool) -> Self {
        Response::Outcome {
            success: true,
            stats: Some(stats),
            message: None,
            pending,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response::Outcome {
            success: false,
            stats: None,
            message: Some(message.into()),
            pending: false,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Response::Outcome { success, .. } => *success,
            Response::Status { status, .. } => *status == Status::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_extension_messages() {
        let msg: Message = serde_json::from_value(json!({"action": "syncStats"})).unwrap();
        assert_eq!(msg, Message::SyncStats);

        let msg: Message = serde_json::from_value(json!({"action": "getStats", "userId": "u1"})).unwrap();
        assert_eq!(msg, Message::GetStats { user_id: Some("u1".to_string()) });

        let msg: Message = serde_json::from_value(json!({"action": "getStats"})).unwrap();
        assert_eq!(msg, Message::GetStats { user_id: None });

        let msg: Message = serde_json::from_value(json!({
            "action": "trackApplication",
            "application": {"url": "https://x.example/job", "title": "SRE"}
        }))
        .unwrap();
        match msg {
            Message::TrackApplication { application } => assert_eq!(application.title, "SRE"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signal_encoding() {
        assert_eq!(
            serde_json::to_value(Message::UserLoggedOut).unwrap(),
            json!({"action": "userLoggedOut"})
        );
        assert_eq!(
            serde_json::to_value(Message::RefreshStats).unwrap(),
            json!({"action": "refreshStats"})
        );
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(serde_json::to_value(Response::ok()).unwrap(), json!({"status": "success"}));
        assert_eq!(
            serde_json::to_value(Response::error("Missing user or stats")).unwrap(),
            json!({"status": "error", "message": "Missing user or stats"})
        );
        assert_eq!(
            serde_json::to_value(Response::failure("No userId provided")).unwrap(),
            json!({"success": false, "message": "No userId provided"})
        );
    }

    #[test]
    fn test_response_round_trip_picks_variant() {
        let back: Response = serde_json::from_value(json!({"status": "error", "message": "x"})).unwrap();
        assert!(!back.is_success());
        let back: Response = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(back.is_success());
    }
}
