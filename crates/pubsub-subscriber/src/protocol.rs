//! Wire protocol: the subscribe envelope, service error bodies, and the
//! [`Codec`] capability with its JSON implementation.

use serde::Deserialize;
use serde_json::Value;

use crate::cursor::Cursor;
use crate::entity::strip_presence;
use crate::error::{Error, Result};
use crate::event::{
    Event, FileEvent, Message, MessageActionEvent, ObjectsEvent, PresenceAction, PresenceEvent,
};

// ---------------------------------------------------------------------------
// Message type constants (`e` field)
// ---------------------------------------------------------------------------

pub mod message_type {
    pub const MESSAGE: u8 = 0;
    pub const SIGNAL: u8 = 1;
    pub const OBJECTS: u8 = 2;
    pub const MESSAGE_ACTION: u8 = 3;
    pub const FILE: u8 = 4;
}

const MAX_ERROR_BODY_CHARS: usize = 256;

/// Decoded long-poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeBatch {
    pub cursor: Cursor,
    pub events: Vec<Event>,
}

/// Details the service attaches to a rejected request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceError {
    pub message: String,
    /// Channels the request was refused for.
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

/// Payload (de)serialisation used by the subscribe loop and heartbeat.
pub trait Codec: Send + Sync {
    fn decode(&self, body: &[u8]) -> Result<SubscribeBatch>;

    /// Never fails: an unreadable body becomes the error message.
    fn decode_service_error(&self, body: &[u8]) -> ServiceError;

    /// Encodes a state payload for use in a query parameter.
    fn encode(&self, value: &Value) -> Result<String>;
}

/// [`Codec`] for the service's JSON envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, body: &[u8]) -> Result<SubscribeBatch> {
        let envelope: WireEnvelope = serde_json::from_slice(body)?;
        let cursor = envelope.t.cursor()?;
        let mut events = Vec::with_capacity(envelope.m.len());
        for (index, msg) in envelope.m.into_iter().enumerate() {
            let channel = msg.channel.clone();
            match decode_event(msg, cursor.timetoken) {
                Ok(event) => events.push(event),
                Err(e) => {
                    // A single bad element must not stall the whole stream.
                    tracing::warn!(index, channel = %channel, "skipping undecodable event: {e}");
                }
            }
        }
        Ok(SubscribeBatch { cursor, events })
    }

    fn decode_service_error(&self, body: &[u8]) -> ServiceError {
        match serde_json::from_slice::<WireServiceError>(body) {
            Ok(err) => {
                let payload = err.payload.unwrap_or_default();
                ServiceError {
                    message: err
                        .message
                        .or(err.error_message)
                        .unwrap_or_else(|| "no error details from service".to_string()),
                    channels: payload.channels,
                    groups: payload
                        .channel_groups
                        .into_iter()
                        .map(|g| g.trim_start_matches(':').to_string())
                        .collect(),
                }
            }
            Err(_) => ServiceError {
                message: String::from_utf8_lossy(body)
                    .chars()
                    .take(MAX_ERROR_BODY_CHARS)
                    .collect(),
                channels: Vec::new(),
                groups: Vec::new(),
            },
        }
    }

    fn encode(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Timetokens arrive as decimal strings; older servers send numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimetoken {
    Text(String),
    Number(u64),
}

impl WireTimetoken {
    fn value(&self) -> Result<u64> {
        match self {
            WireTimetoken::Text(s) => s
                .parse::<u64>()
                .map_err(|e| Error::Decode(format!("invalid timetoken {s:?}: {e}"))),
            WireTimetoken::Number(n) => Ok(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCursor {
    t: WireTimetoken,
    #[serde(default)]
    r: Option<u32>,
}

impl WireCursor {
    fn cursor(&self) -> Result<Cursor> {
        Ok(Cursor::new(self.t.value()?, self.r))
    }
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    t: WireCursor,
    #[serde(default)]
    m: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "c")]
    channel: String,
    #[serde(rename = "b", default)]
    subscription: Option<String>,
    #[serde(rename = "d", default)]
    payload: Value,
    #[serde(rename = "e", default)]
    kind: Option<u8>,
    #[serde(rename = "i", default)]
    issuer: Option<String>,
    #[serde(rename = "p", default)]
    publish: Option<WireCursor>,
    #[serde(rename = "u", default)]
    metadata: Option<Value>,
    #[serde(rename = "cmt", default)]
    custom_type: Option<String>,
    #[serde(rename = "si", default)]
    space_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePresence {
    action: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    occupancy: Option<u64>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    join: Vec<String>,
    #[serde(default)]
    leave: Vec<String>,
    #[serde(default)]
    timeout: Vec<String>,
    #[serde(default)]
    here_now_refresh: bool,
}

#[derive(Debug, Deserialize)]
struct WireObjects {
    event: String,
    #[serde(rename = "type")]
    object_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WireAction {
    event: String,
    data: WireActionData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireActionData {
    #[serde(rename = "type")]
    action_type: String,
    value: String,
    message_timetoken: WireTimetoken,
    action_timetoken: WireTimetoken,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    #[serde(default)]
    message: Option<Value>,
    file: WireFileInfo,
}

#[derive(Debug, Deserialize)]
struct WireFileInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireServiceError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    payload: Option<WireErrorPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct WireErrorPayload {
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default, rename = "channel-groups")]
    channel_groups: Vec<String>,
}

// ---------------------------------------------------------------------------
// Element decoding
// ---------------------------------------------------------------------------

fn decode_event(msg: WireMessage, batch_timetoken: u64) -> Result<Event> {
    let timetoken = match &msg.publish {
        Some(p) => p.t.value()?,
        None => batch_timetoken,
    };

    if let Some(base) = strip_presence(&msg.channel) {
        let channel = base.to_string();
        let subscription = subscription_for(&channel, msg.subscription.as_deref());
        return decode_presence(channel, subscription, msg.payload, timetoken);
    }

    let subscription = subscription_for(&msg.channel, msg.subscription.as_deref());
    match msg.kind.unwrap_or(message_type::MESSAGE) {
        message_type::SIGNAL => Ok(Event::Signal(plain_message(msg, subscription, timetoken))),
        message_type::OBJECTS => {
            let objects: WireObjects = serde_json::from_value(msg.payload)?;
            Ok(Event::Objects(ObjectsEvent {
                channel: msg.channel,
                subscription,
                event: objects.event,
                object_type: objects.object_type,
                data: objects.data,
                timetoken,
            }))
        }
        message_type::MESSAGE_ACTION => {
            let action: WireAction = serde_json::from_value(msg.payload)?;
            Ok(Event::MessageAction(MessageActionEvent {
                channel: msg.channel,
                subscription,
                publisher: msg.issuer,
                event: action.event,
                action_type: action.data.action_type,
                value: action.data.value,
                message_timetoken: action.data.message_timetoken.value()?,
                action_timetoken: action.data.action_timetoken.value()?,
                timetoken,
            }))
        }
        message_type::FILE => {
            let file: WireFile = serde_json::from_value(msg.payload)?;
            Ok(Event::File(FileEvent {
                channel: msg.channel,
                subscription,
                publisher: msg.issuer,
                message: file.message,
                file_id: file.file.id,
                file_name: file.file.name,
                metadata: msg.metadata,
                timetoken,
            }))
        }
        message_type::MESSAGE => Ok(Event::Message(plain_message(msg, subscription, timetoken))),
        other => Err(Error::Decode(format!("unknown message type {other}"))),
    }
}

fn plain_message(msg: WireMessage, subscription: Option<String>, timetoken: u64) -> Message {
    Message {
        channel: msg.channel,
        subscription,
        publisher: msg.issuer,
        payload: msg.payload,
        timetoken,
        metadata: msg.metadata,
        message_type: msg.custom_type,
        space_id: msg.space_id,
    }
}

fn decode_presence(
    channel: String,
    subscription: Option<String>,
    payload: Value,
    timetoken: u64,
) -> Result<Event> {
    let wire: WirePresence = serde_json::from_value(payload)?;
    let action = PresenceAction::parse(&wire.action)
        .ok_or_else(|| Error::Decode(format!("unknown presence action {:?}", wire.action)))?;
    Ok(Event::Presence(PresenceEvent {
        channel,
        subscription,
        action,
        uuid: wire.uuid,
        occupancy: wire.occupancy,
        timestamp: wire.timestamp,
        state: wire.data,
        join: wire.join,
        leave: wire.leave,
        timeout: wire.timeout,
        here_now_refresh: wire.here_now_refresh,
        timetoken,
    }))
}

/// Subscription match without presence suffix; `None` when it is the channel itself.
fn subscription_for(channel: &str, subscription: Option<&str>) -> Option<String> {
    let sub = subscription?;
    let sub = strip_presence(sub).unwrap_or(sub);
    (sub != channel).then(|| sub.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(body: Value) -> SubscribeBatch {
        JsonCodec.decode(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn empty_handshake_response() {
        let batch = decode(json!({"t": {"t": "15000000000000000", "r": 4}, "m": []}));
        assert_eq!(batch.cursor, Cursor::new(15_000_000_000_000_000, Some(4)));
        assert!(batch.events.is_empty());
    }

    #[test]
    fn numeric_timetoken_and_missing_messages() {
        let batch = decode(json!({"t": {"t": 42}}));
        assert_eq!(batch.cursor.timetoken, 42);
        assert_eq!(batch.cursor.region, None);
    }

    #[test]
    fn message_with_metadata() {
        let batch = decode(json!({
            "t": {"t": "16000000000000002", "r": 1},
            "m": [{
                "a": "1", "f": 0, "i": "publisher-1",
                "p": {"t": "16000000000000001", "r": 1},
                "k": "demo", "c": "chat", "b": "chat",
                "d": {"text": "hi"}, "u": {"lang": "en"}, "cmt": "greeting"
            }]
        }));
        match &batch.events[..] {
            [Event::Message(m)] => {
                assert_eq!(m.channel, "chat");
                assert_eq!(m.subscription, None);
                assert_eq!(m.publisher.as_deref(), Some("publisher-1"));
                assert_eq!(m.payload, json!({"text": "hi"}));
                assert_eq!(m.timetoken, 16_000_000_000_000_001);
                assert_eq!(m.metadata, Some(json!({"lang": "en"})));
                assert_eq!(m.message_type.as_deref(), Some("greeting"));
            }
            other => panic!("expected one message, got {other:?}"),
        }
    }

    #[test]
    fn group_subscription_is_kept() {
        let batch = decode(json!({
            "t": {"t": "2"},
            "m": [{"c": "room-1", "b": "rooms", "d": 1, "p": {"t": "1"}}]
        }));
        assert_eq!(batch.events[0].channel(), "room-1");
        match &batch.events[0] {
            Event::Message(m) => assert_eq!(m.subscription.as_deref(), Some("rooms")),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn signal_type() {
        let batch = decode(json!({
            "t": {"t": "2"},
            "m": [{"c": "typing", "e": 1, "d": "on", "p": {"t": "1"}}]
        }));
        assert!(matches!(&batch.events[0], Event::Signal(s) if s.payload == json!("on")));
    }

    #[test]
    fn presence_join_on_shadow_channel() {
        let batch = decode(json!({
            "t": {"t": "2"},
            "m": [{
                "c": "chat-pnpres", "b": "chat-pnpres", "p": {"t": "1"},
                "d": {"action": "join", "uuid": "u-7", "timestamp": 1700000000,
                      "occupancy": 3, "data": {"mood": "calm"}}
            }]
        }));
        match &batch.events[0] {
            Event::Presence(p) => {
                assert_eq!(p.channel, "chat");
                assert_eq!(p.subscription, None);
                assert_eq!(p.action, PresenceAction::Join);
                assert_eq!(p.uuid.as_deref(), Some("u-7"));
                assert_eq!(p.occupancy, Some(3));
                assert_eq!(p.state, Some(json!({"mood": "calm"})));
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[test]
    fn presence_interval_with_deltas() {
        let batch = decode(json!({
            "t": {"t": "2"},
            "m": [{
                "c": "lobby-pnpres", "p": {"t": "1"},
                "d": {"action": "interval", "occupancy": 10, "timestamp": 1,
                      "join": ["a", "b"], "leave": ["c"], "here_now_refresh": false}
            }]
        }));
        match &batch.events[0] {
            Event::Presence(p) => {
                assert_eq!(p.action, PresenceAction::Interval);
                assert_eq!(p.join, vec!["a", "b"]);
                assert_eq!(p.leave, vec!["c"]);
                assert!(p.timeout.is_empty());
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[test]
    fn objects_action_and_file_events() {
        let batch = decode(json!({
            "t": {"t": "9"},
            "m": [
                {"c": "ch", "e": 2, "p": {"t": "3"},
                 "d": {"source": "objects", "version": "2.0", "event": "set",
                       "type": "channel", "data": {"id": "ch"}}},
                {"c": "ch", "e": 3, "i": "u1", "p": {"t": "4"},
                 "d": {"source": "actions", "event": "added",
                       "data": {"type": "reaction", "value": "smile",
                                "messageTimetoken": "2", "actionTimetoken": "4"}}},
                {"c": "ch", "e": 4, "i": "u2", "p": {"t": "5"},
                 "d": {"message": "see file", "file": {"id": "f-1", "name": "cat.png"}}}
            ]
        }));
        assert_eq!(batch.events.len(), 3);
        assert!(matches!(&batch.events[0], Event::Objects(o) if o.event == "set" && o.object_type == "channel"));
        match &batch.events[1] {
            Event::MessageAction(a) => {
                assert_eq!(a.action_type, "reaction");
                assert_eq!(a.value, "smile");
                assert_eq!(a.message_timetoken, 2);
                assert_eq!(a.action_timetoken, 4);
                assert_eq!(a.publisher.as_deref(), Some("u1"));
            }
            other => panic!("expected message action, got {other:?}"),
        }
        match &batch.events[2] {
            Event::File(f) => {
                assert_eq!(f.file_id, "f-1");
                assert_eq!(f.file_name, "cat.png");
                assert_eq!(f.message, Some(json!("see file")));
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn bad_element_is_skipped_order_preserved() {
        let batch = decode(json!({
            "t": {"t": "9"},
            "m": [
                {"c": "a", "d": 1, "p": {"t": "1"}},
                {"c": "a-pnpres", "d": {"action": "dance"}, "p": {"t": "2"}},
                {"c": "a", "d": 3, "p": {"t": "3"}}
            ]
        }));
        let tts: Vec<u64> = batch.events.iter().map(Event::timetoken).collect();
        assert_eq!(tts, vec![1, 3]);
    }

    #[test]
    fn broken_envelope_is_decode_error() {
        assert!(matches!(JsonCodec.decode(b"<html>"), Err(Error::Decode(_))));
        assert!(matches!(
            JsonCodec.decode(br#"{"t": {"t": "not-a-number"}}"#),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn access_denied_body() {
        let body = json!({
            "status": 403, "error": true, "message": "Forbidden",
            "service": "Access Manager",
            "payload": {"channels": ["secret"], "channel-groups": [":vault"]}
        });
        let err = JsonCodec.decode_service_error(body.to_string().as_bytes());
        assert_eq!(err.message, "Forbidden");
        assert_eq!(err.channels, vec!["secret"]);
        assert_eq!(err.groups, vec!["vault"]);
    }

    #[test]
    fn unreadable_error_body_becomes_message() {
        let err = JsonCodec.decode_service_error(b"Bad Gateway");
        assert_eq!(err.message, "Bad Gateway");
        assert!(err.channels.is_empty());
    }

    #[test]
    fn encode_state() {
        let s = JsonCodec.encode(&json!({"chat": {"mood": "calm"}})).unwrap();
        assert_eq!(s, r#"{"chat":{"mood":"calm"}}"#);
    }
}
