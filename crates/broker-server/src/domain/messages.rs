//! JSON envelope spoken by the channel router on Management connections.
//!
//! Each WebSocket text message carries exactly one request or response.
//! The `type` field selects the variant:
//!
//! ```json
//! {"type":"call","id":1,"channel":"ping","command":"ping","arg":"hi"}
//! {"type":"result","id":1,"data":"hi"}
//! {"type":"listen","id":2,"channel":"files","event":"changed","arg":null}
//! {"type":"event","id":2,"data":{"path":"/src/main.rs"}}
//! {"type":"dispose","id":2}
//! ```
//!
//! Request ids are chosen by the client and only need to be unique among
//! that client's in-flight calls and live subscriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouterRequest {
    /// One request, one response.
    Call {
        id: u64,
        channel: String,
        command: String,
        #[serde(default)]
        arg: Value,
    },
    /// Subscribe to an event stream.  Events keep flowing across reconnects
    /// until the client disposes the subscription or the connection closes.
    Listen {
        id: u64,
        channel: String,
        event: String,
        #[serde(default)]
        arg: Value,
    },
    /// Cancel a subscription created by `listen`.
    Dispose { id: u64 },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouterResponse {
    Result { id: u64, data: Value },
    Error { id: u64, message: String },
    Event { id: u64, data: Value },
    /// The event stream ended on the server side.
    EventEnd { id: u64 },
}

impl RouterResponse {
    /// Serialises the response as the text of one WebSocket message.
    pub fn to_outbound(&self) -> Outbound {
        // Serialising these plain enums cannot fail.
        Outbound::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// One message waiting in a connection's outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_request_parses_with_missing_arg() {
        // Arrange
        let raw = r#"{"type":"call","id":1,"channel":"ping","command":"ping"}"#;
        // Act
        let req: RouterRequest = serde_json::from_str(raw).unwrap();
        // Assert
        assert_eq!(
            req,
            RouterRequest::Call {
                id: 1,
                channel: "ping".into(),
                command: "ping".into(),
                arg: Value::Null,
            }
        );
    }

    #[test]
    fn test_dispose_request_parses() {
        let req: RouterRequest = serde_json::from_str(r#"{"type":"dispose","id":42}"#).unwrap();
        assert_eq!(req, RouterRequest::Dispose { id: 42 });
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        let result = serde_json::from_str::<RouterRequest>(r#"{"type":"explode","id":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_end_uses_camel_case_tag() {
        let json = serde_json::to_value(RouterResponse::EventEnd { id: 3 }).unwrap();
        assert_eq!(json, json!({"type": "eventEnd", "id": 3}));
    }

    #[test]
    fn test_to_outbound_produces_text_json() {
        // Arrange
        let resp = RouterResponse::Result {
            id: 7,
            data: json!({"ok": true}),
        };
        // Act
        let Outbound::Text(text) = resp.to_outbound() else {
            panic!("router responses are text messages");
        };
        // Assert
        let parsed: RouterResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, resp);
    }
}
