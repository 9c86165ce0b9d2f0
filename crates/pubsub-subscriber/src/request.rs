//! Request descriptors for the endpoints the subscribe core talks to.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::ClientConfig;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::protocol::Codec;
use crate::retry::Endpoint;
use crate::subscription_set::SubscriptionSnapshot;
use crate::transport::{Request, Response, TransportError};

/// Placeholder path segment when only channel groups are listed.
const EMPTY_CHANNEL_LIST: &str = ",";

/// Long-poll for `snapshot` starting after `cursor`.
pub(crate) fn subscribe(
    config: &ClientConfig,
    codec: &dyn Codec,
    snapshot: &SubscriptionSnapshot,
    cursor: Cursor,
) -> Result<Request> {
    let mut query = vec![("tt".to_string(), cursor.timetoken.to_string())];
    if let Some(region) = cursor.region.filter(|_| !cursor.is_zero()) {
        query.push(("tr".to_string(), region.to_string()));
    }
    push_groups(&mut query, &snapshot.subscribe_groups());
    if let Some(value) = config.heartbeat_value() {
        query.push(("heartbeat".to_string(), value.to_string()));
    }
    push_state(&mut query, codec, &snapshot.state)?;
    if let Some(filter) = config.filter_expression.as_deref().filter(|f| !f.is_empty()) {
        query.push(("filter-expr".to_string(), filter.to_string()));
    }
    push_identity(&mut query, config);

    Ok(Request {
        path: vec![
            "v2".to_string(),
            "subscribe".to_string(),
            config.subscribe_key.clone(),
            channel_segment(&snapshot.subscribe_channels()),
            "0".to_string(),
        ],
        query,
        timeout: config.timing.subscribe_max_idle,
        endpoint: Endpoint::Subscribe,
    })
}

/// Presence heartbeat for regular (non-presence) entities.
pub(crate) fn heartbeat(
    config: &ClientConfig,
    codec: &dyn Codec,
    channels: &[String],
    groups: &[String],
    state: &BTreeMap<String, Value>,
) -> Result<Request> {
    let mut query = Vec::new();
    if let Some(value) = config.heartbeat_value() {
        query.push(("heartbeat".to_string(), value.to_string()));
    }
    push_groups(&mut query, groups);
    push_state(&mut query, codec, state)?;
    push_identity(&mut query, config);
    Ok(presence_request(config, channels, "heartbeat", query))
}

/// Explicit leave announcement.
pub(crate) fn leave(config: &ClientConfig, channels: &[String], groups: &[String]) -> Request {
    let mut query = Vec::new();
    push_groups(&mut query, groups);
    push_identity(&mut query, config);
    presence_request(config, channels, "leave", query)
}

/// Service time, used as a reachability probe.
pub(crate) fn time(config: &ClientConfig) -> Request {
    let mut query = Vec::new();
    push_identity(&mut query, config);
    Request {
        path: vec!["time".to_string(), "0".to_string()],
        query,
        timeout: config.timing.request_timeout,
        endpoint: Endpoint::Time,
    }
}

fn presence_request(
    config: &ClientConfig,
    channels: &[String],
    action: &str,
    query: Vec<(String, String)>,
) -> Request {
    Request {
        path: vec![
            "v2".to_string(),
            "presence".to_string(),
            "sub-key".to_string(),
            config.subscribe_key.clone(),
            "channel".to_string(),
            channel_segment(channels),
            action.to_string(),
        ],
        query,
        timeout: config.timing.request_timeout,
        endpoint: Endpoint::Presence,
    }
}

fn channel_segment(channels: &[String]) -> String {
    if channels.is_empty() {
        EMPTY_CHANNEL_LIST.to_string()
    } else {
        channels.join(",")
    }
}

fn push_groups(query: &mut Vec<(String, String)>, groups: &[String]) {
    if !groups.is_empty() {
        query.push(("channel-group".to_string(), groups.join(",")));
    }
}

fn push_state(
    query: &mut Vec<(String, String)>,
    codec: &dyn Codec,
    state: &BTreeMap<String, Value>,
) -> Result<()> {
    if state.is_empty() {
        return Ok(());
    }
    let object: serde_json::Map<String, Value> = state
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    query.push(("state".to_string(), codec.encode(&Value::Object(object))?));
    Ok(())
}

fn push_identity(query: &mut Vec<(String, String)>, config: &ClientConfig) {
    query.push(("uuid".to_string(), config.user_id.clone()));
    if let Some(auth) = config.auth_key.as_deref().filter(|a| !a.is_empty()) {
        query.push(("auth".to_string(), auth.to_string()));
    }
}

/// Maps a transport outcome onto the error taxonomy, yielding the body of a
/// 2xx response.
pub(crate) fn classify(
    codec: &dyn Codec,
    outcome: std::result::Result<Response, TransportError>,
) -> Result<Vec<u8>> {
    let response = outcome?;
    if response.is_success() {
        return Ok(response.body);
    }
    let service = codec.decode_service_error(&response.body);
    Err(match response.status {
        401 | 403 => Error::AccessDenied {
            message: service.message,
            channels: service.channels,
            groups: service.groups,
        },
        429 => Error::RateLimited,
        status if status >= 500 => {
            Error::NetworkUnreachable(format!("service error {status}: {}", service.message))
        }
        status => Error::BadRequest {
            status,
            message: service.message,
        },
    })
}
