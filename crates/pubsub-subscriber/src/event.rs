//! Events decoded from a long-poll batch.

use serde_json::Value;

/// A published message or signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: String,
    /// Subscription that matched (channel group or wildcard), when it differs
    /// from `channel`.
    pub subscription: Option<String>,
    /// Publisher's user id.
    pub publisher: Option<String>,
    pub payload: Value,
    /// Publish timetoken.
    pub timetoken: u64,
    pub metadata: Option<Value>,
    /// Custom message type set by the publisher.
    pub message_type: Option<String>,
    pub space_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

impl PresenceAction {
    pub(crate) fn parse(action: &str) -> Option<Self> {
        match action {
            "join" => Some(PresenceAction::Join),
            "leave" => Some(PresenceAction::Leave),
            "timeout" => Some(PresenceAction::Timeout),
            "state-change" => Some(PresenceAction::StateChange),
            "interval" => Some(PresenceAction::Interval),
            _ => None,
        }
    }
}

/// Presence change on a channel (received on its `-pnpres` shadow).
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    /// Regular channel name (presence suffix stripped).
    pub channel: String,
    pub subscription: Option<String>,
    pub action: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: Option<u64>,
    /// Seconds since epoch, as reported by the service.
    pub timestamp: Option<u64>,
    /// State attached by the user that joined or changed state.
    pub state: Option<Value>,
    /// Interval events: users that joined since the last interval.
    pub join: Vec<String>,
    pub leave: Vec<String>,
    pub timeout: Vec<String>,
    /// Interval event too large to list members; refresh via here-now.
    pub here_now_refresh: bool,
    pub timetoken: u64,
}

/// App-context (objects) change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectsEvent {
    pub channel: String,
    pub subscription: Option<String>,
    /// `set` or `delete`.
    pub event: String,
    /// `uuid`, `channel` or `membership`.
    pub object_type: String,
    pub data: Value,
    pub timetoken: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageActionEvent {
    pub channel: String,
    pub subscription: Option<String>,
    pub publisher: Option<String>,
    /// `added` or `removed`.
    pub event: String,
    pub action_type: String,
    pub value: String,
    pub message_timetoken: u64,
    pub action_timetoken: u64,
    pub timetoken: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEvent {
    pub channel: String,
    pub subscription: Option<String>,
    pub publisher: Option<String>,
    /// Message published alongside the file.
    pub message: Option<Value>,
    pub file_id: String,
    pub file_name: String,
    pub metadata: Option<Value>,
    pub timetoken: u64,
}

/// One element of a long-poll response.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    Signal(Message),
    Presence(PresenceEvent),
    Objects(ObjectsEvent),
    MessageAction(MessageActionEvent),
    File(FileEvent),
}

impl Event {
    pub fn channel(&self) -> &str {
        match self {
            Event::Message(m) | Event::Signal(m) => &m.channel,
            Event::Presence(p) => &p.channel,
            Event::Objects(o) => &o.channel,
            Event::MessageAction(a) => &a.channel,
            Event::File(f) => &f.channel,
        }
    }

    pub fn timetoken(&self) -> u64 {
        match self {
            Event::Message(m) | Event::Signal(m) => m.timetoken,
            Event::Presence(p) => p.timetoken,
            Event::Objects(o) => o.timetoken,
            Event::MessageAction(a) => a.timetoken,
            Event::File(f) => f.timetoken,
        }
    }
}
