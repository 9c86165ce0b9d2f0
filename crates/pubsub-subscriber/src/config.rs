//! Client configuration consumed at construction.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
const DEFAULT_SUBSCRIBE_MAX_IDLE: Duration = Duration::from_secs(310);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REACHABILITY_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT_VALUE: u32 = 5;
const MAX_HEARTBEAT_VALUE: u32 = 300;

/// Which heartbeat outcomes are reported to listeners as [`Status`](crate::Status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatNotify {
    None,
    #[default]
    Failures,
    All,
}

/// Timing knobs for requests and the reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Ceiling a long-poll may stay open before the transport gives up.
    pub subscribe_max_idle: Duration,
    /// Timeout for heartbeat, leave and time requests.
    pub request_timeout: Duration,
    /// Interval between time-endpoint probes after an unexpected disconnect.
    /// `None` disables probing.
    pub reachability_probe_interval: Option<Duration>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            subscribe_max_idle: DEFAULT_SUBSCRIBE_MAX_IDLE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reachability_probe_interval: Some(DEFAULT_REACHABILITY_PROBE_INTERVAL),
        }
    }
}

/// Configuration for [`SubscribeClient`](crate::SubscribeClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub subscribe_key: String,
    pub user_id: String,
    pub auth_key: Option<String>,
    /// Service host. Defaults to `"ps.pndsn.com"`.
    pub origin: String,
    /// Use https (default) or plain http.
    pub secure: bool,
    pub filter_expression: Option<String>,
    /// Seconds the service keeps this client present without traffic.
    /// Clamped to `[5, 300]`. `None` disables presence heartbeat.
    pub presence_heartbeat_value: Option<u32>,
    /// Seconds between heartbeat requests. Defaults to `value / 2 - 1`.
    pub presence_heartbeat_interval: Option<u32>,
    pub heartbeat_notify: HeartbeatNotify,
    /// Resume the subscribe loop once connectivity returns.
    pub restore_subscription: bool,
    /// On restore, continue from the pre-disconnect cursor.
    pub catch_up_on_restore: bool,
    /// Keep the cursor when channels are added or removed mid-session.
    pub keep_timetoken_on_list_change: bool,
    /// Skip the leave announcement on unsubscribe.
    pub suppress_leave_events: bool,
    /// Report a status when one response carries at least this many events.
    /// `0` disables the check.
    pub request_message_count_threshold: usize,
    /// `None` disables automatic retry.
    pub retry: Option<RetryPolicy>,
    /// Runtime on which listener callbacks run. Defaults to the runtime the
    /// client was created on.
    pub callback_runtime: Option<tokio::runtime::Handle>,
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(subscribe_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            subscribe_key: subscribe_key.into(),
            user_id: user_id.into(),
            auth_key: None,
            origin: DEFAULT_ORIGIN.to_string(),
            secure: true,
            filter_expression: None,
            presence_heartbeat_value: None,
            presence_heartbeat_interval: None,
            heartbeat_notify: HeartbeatNotify::default(),
            restore_subscription: true,
            catch_up_on_restore: true,
            keep_timetoken_on_list_change: true,
            suppress_leave_events: false,
            request_message_count_threshold: 0,
            retry: Some(RetryPolicy::default()),
            callback_runtime: None,
            timing: TimingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::Configuration("missing subscribe key".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::Configuration("missing user id".to_string()));
        }
        if self.origin.trim().is_empty() {
            return Err(Error::Configuration("missing origin".to_string()));
        }
        Ok(())
    }

    /// Heartbeat value after clamping, in seconds.
    pub(crate) fn heartbeat_value(&self) -> Option<u32> {
        self.presence_heartbeat_value
            .map(|v| v.clamp(MIN_HEARTBEAT_VALUE, MAX_HEARTBEAT_VALUE))
    }

    /// Period of the heartbeat timer, if heartbeating is enabled.
    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        let value = self.heartbeat_value()?;
        let interval = match self.presence_heartbeat_interval {
            Some(0) => return None,
            Some(i) => i.min(value),
            None => (value / 2).saturating_sub(1),
        };
        Some(Duration::from_secs(u64::from(interval.max(1))))
    }

    pub(crate) fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.origin)
    }
}
