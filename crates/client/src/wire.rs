//! JSON shapes exchanged with the server, and their mapping into engine types.

use chatwire_engine::{
    Artifact, ChartKind, DeltaEvent, MessageToken, Role, Session, SessionId, TableData, Turn,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SEND_MESSAGE_EVENT: &str = "send_message";
pub const MESSAGE_RECEIVED_EVENT: &str = "message_received";
pub const RECEIVE_MESSAGE_EVENT: &str = "receive_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

impl From<WireRole> for Role {
    fn from(value: WireRole) -> Self {
        match value {
            WireRole::User => Role::User,
            WireRole::Assistant => Role::Assistant,
        }
    }
}

/// `GET /sessions/{id}/messages`
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesBody {
    pub messages: Vec<MessageRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRow {
    pub text: String,
    pub role: WireRole,
    #[serde(default, deserialize_with = "opaque_token")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub table_data: Option<TableData>,
    #[serde(default, rename = "type")]
    pub chart_type: Option<String>,
}

impl MessageRow {
    pub fn into_turn(self) -> Turn {
        let mut turn = Turn::settled(self.role.into(), self.text);
        if let Some(message_id) = self.message_id {
            turn = turn.with_message_id(MessageToken::new(message_id));
        }
        if let Some(table) = self.table_data {
            let chart = self.chart_type.as_deref().map(ChartKind::parse);
            turn = turn.with_table(table, chart);
        }
        turn
    }
}

/// `GET /sessions/{id}/file`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileBody {
    #[serde(default)]
    pub file: Option<Artifact>,
}

/// `POST /sessions`
#[derive(Debug, Clone, Deserialize)]
pub struct SessionBody {
    pub session: SessionRow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            artifact: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Client-to-server duplex frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage { session_id: SessionId, text: String },
}

/// Server-to-client duplex frame after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `message_received`: the server accepted the send.
    Acknowledged,
    /// `receive_message`: one delta.
    Delta(DeltaEvent),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ReceivePayload {
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default, deserialize_with = "opaque_token")]
    message_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    table_data: Option<TableData>,
    #[serde(default)]
    chart_type: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    role: Option<WireRole>,
}

impl From<ReceivePayload> for DeltaEvent {
    fn from(payload: ReceivePayload) -> Self {
        DeltaEvent {
            session_id: payload.session_id,
            message_id: payload.message_id.map(MessageToken::new),
            text_fragment: payload.text,
            table: payload.table_data,
            chart: payload.chart_type.as_deref().map(ChartKind::parse),
            done: payload.done.unwrap_or(false),
            echo: payload.role == Some(WireRole::User),
        }
    }
}

/// Decodes one text frame; unknown events and undecodable payloads yield `None`.
pub fn decode_server_frame(raw: &str) -> Option<ServerFrame> {
    let envelope = match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(error = %error, "dropping undecodable channel frame");
            return None;
        }
    };

    match envelope.event.as_str() {
        MESSAGE_RECEIVED_EVENT => Some(ServerFrame::Acknowledged),
        RECEIVE_MESSAGE_EVENT => {
            let data = if envelope.data.is_null() {
                Value::Object(Default::default())
            } else {
                envelope.data
            };
            match serde_json::from_value::<ReceivePayload>(data) {
                Ok(payload) => Some(ServerFrame::Delta(payload.into())),
                Err(error) => {
                    tracing::debug!(error = %error, "dropping malformed receive_message payload");
                    None
                }
            }
        }
        other => {
            tracing::debug!(event = other, "ignoring unknown channel event");
            None
        }
    }
}

pub fn encode_client_frame(frame: &ClientFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

// Tokens are opaque; some backends send them as numbers.
fn opaque_token<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => Some(raw),
        Some(Value::Number(raw)) => Some(raw.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_rows_map_bot_role_and_optional_fields() {
        let body: MessagesBody = serde_json::from_value(json!({
            "messages": [
                { "text": "hi", "role": "user" },
                {
                    "text": "",
                    "role": "bot",
                    "message_id": 42,
                    "table_data": { "columns": ["a"], "rows": [[1]] },
                    "type": "bar"
                }
            ]
        }))
        .expect("valid messages body");

        let turns = body
            .messages
            .into_iter()
            .map(MessageRow::into_turn)
            .collect::<Vec<_>>();

        assert_eq!(turns[0], Turn::user("hi"));
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].message_id, Some(MessageToken::new("42")));
        assert_eq!(turns[1].chart, Some(ChartKind::Bar));
        assert!(turns[1].table.is_some());
    }

    #[test]
    fn message_row_without_role_is_rejected() {
        let parsed = serde_json::from_value::<MessagesBody>(json!({
            "messages": [{ "text": "orphan" }]
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn receive_message_frames_become_deltas() {
        let frame = decode_server_frame(
            r#"{"event":"receive_message","data":{"message_id":"m1","text":"Hel"}}"#,
        );
        assert_eq!(frame, Some(ServerFrame::Delta(DeltaEvent::text("m1", "Hel"))));

        let done = decode_server_frame(
            r#"{"event":"receive_message","data":{"message_id":"m1","done":true}}"#,
        );
        assert_eq!(done, Some(ServerFrame::Delta(DeltaEvent::done("m1"))));
    }

    #[test]
    fn user_role_marks_the_delta_as_an_echo() {
        let frame = decode_server_frame(
            r#"{"event":"receive_message","data":{"text":"hello","role":"user"}}"#,
        );
        let Some(ServerFrame::Delta(event)) = frame else {
            panic!("expected a delta frame");
        };
        assert!(event.echo);
    }

    #[test]
    fn acknowledgment_and_unknown_events_decode_as_expected() {
        assert_eq!(
            decode_server_frame(r#"{"event":"message_received","data":{}}"#),
            Some(ServerFrame::Acknowledged)
        );
        assert_eq!(
            decode_server_frame(r#"{"event":"message_received"}"#),
            Some(ServerFrame::Acknowledged)
        );
        assert_eq!(decode_server_frame(r#"{"event":"typing"}"#), None);
        assert_eq!(decode_server_frame("not json"), None);
    }

    #[test]
    fn send_message_frame_uses_event_envelope() {
        let encoded = encode_client_frame(&ClientFrame::SendMessage {
            session_id: SessionId::new(3),
            text: "What is 2+2?".to_string(),
        })
        .expect("frame encodes");

        let value: Value = serde_json::from_str(&encoded).expect("frame is json");
        assert_eq!(
            value,
            json!({ "event": "send_message", "data": { "session_id": 3, "text": "What is 2+2?" } })
        );
    }
}
