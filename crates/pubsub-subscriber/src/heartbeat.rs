//! Presence heartbeat timer, leave announcements and manual presence.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, HeartbeatNotify};
use crate::error::Error;
use crate::listener::ListenerRegistry;
use crate::protocol::Codec;
use crate::request;
use crate::status::{Operation, Status, StatusCategory};
use crate::subscription_set::SubscriptionSet;
use crate::transport::Transport;

/// Channels and groups the application marked present without subscribing.
#[derive(Debug, Default)]
struct ManualPresence {
    channels: BTreeSet<String>,
    groups: BTreeSet<String>,
}

pub(crate) struct Heartbeat {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    subscriptions: Arc<SubscriptionSet>,
    listeners: ListenerRegistry,
    manual: Mutex<ManualPresence>,
    last_long_poll: Mutex<Option<Instant>>,
}

impl Heartbeat {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        subscriptions: Arc<SubscriptionSet>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            config,
            transport,
            codec,
            subscriptions,
            listeners,
            manual: Mutex::new(ManualPresence::default()),
            last_long_poll: Mutex::new(None),
        }
    }

    /// Starts the periodic timer when presence heartbeat is enabled.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let period = self.config.heartbeat_interval()?;
        let this = Arc::clone(self);
        tracing::debug!(period_secs = period.as_secs(), "starting presence heartbeat");
        Some(runtime.spawn(async move { this.run(period, shutdown).await }))
    }

    async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::trace!("heartbeat timer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.long_poll_covers(period) {
                        tracing::trace!("long-poll traffic is recent, skipping heartbeat");
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = self.beat() => {}
                    }
                }
            }
        }
    }

    /// Records that a long-poll carrying the heartbeat value went out.
    pub(crate) fn long_poll_issued(&self) {
        *self
            .last_long_poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn long_poll_covers(&self, period: Duration) -> bool {
        self.last_long_poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < period)
    }

    /// Sends one heartbeat for subscribed and manually-present entities.
    /// Returns `None` when there is nothing to heartbeat.
    pub(crate) async fn beat(&self) -> Option<Status> {
        let snapshot = self.subscriptions.snapshot();
        let (channels, groups) = {
            let manual = self.manual.lock().unwrap_or_else(PoisonError::into_inner);
            let channels: BTreeSet<String> = snapshot
                .channels
                .iter()
                .chain(&manual.channels)
                .cloned()
                .collect();
            let groups: BTreeSet<String> = snapshot
                .groups
                .iter()
                .chain(&manual.groups)
                .cloned()
                .collect();
            (
                channels.into_iter().collect::<Vec<_>>(),
                groups.into_iter().collect::<Vec<_>>(),
            )
        };
        if channels.is_empty() && groups.is_empty() {
            return None;
        }
        Some(self.send_heartbeat(channels, groups).await)
    }

    async fn send_heartbeat(&self, channels: Vec<String>, groups: Vec<String>) -> Status {
        let state = self.subscriptions.snapshot().state;
        let outcome = match request::heartbeat(
            &self.config,
            self.codec.as_ref(),
            &channels,
            &groups,
            &state,
        ) {
            Ok(req) => request::classify(self.codec.as_ref(), self.transport.send(req).await),
            Err(e) => Err(e),
        };
        let status = match outcome {
            Ok(_) => {
                tracing::trace!(channels = ?channels, groups = ?groups, "heartbeat acknowledged");
                Status::new(StatusCategory::Acknowledgment, Operation::Heartbeat)
            }
            Err(e) => {
                tracing::warn!(channels = ?channels, "heartbeat failed: {e}");
                Status::failure(StatusCategory::for_error(&e), Operation::Heartbeat, e)
            }
        }
        .with_affected(channels, groups);

        let notify = match self.config.heartbeat_notify {
            HeartbeatNotify::All => true,
            HeartbeatNotify::Failures => status.is_error,
            HeartbeatNotify::None => false,
        };
        if notify {
            self.listeners.dispatch_status(status.clone());
        }
        status
    }

    /// Announces that this client stopped observing `channels` and `groups`.
    pub(crate) async fn leave(&self, channels: Vec<String>, groups: Vec<String>) -> Status {
        let req = request::leave(&self.config, &channels, &groups);
        let outcome = request::classify(self.codec.as_ref(), self.transport.send(req).await);
        match outcome {
            Ok(_) => {
                tracing::debug!(channels = ?channels, groups = ?groups, "leave announced");
                Status::new(StatusCategory::Acknowledgment, Operation::Leave)
                    .with_affected(channels, groups)
            }
            Err(e) => {
                tracing::warn!(channels = ?channels, groups = ?groups, "leave failed: {e}");
                let status = Status::failure(StatusCategory::for_error(&e), Operation::Leave, e)
                    .with_affected(channels, groups);
                self.listeners.dispatch_status(status.clone());
                status
            }
        }
    }

    /// Marks this client present (or absent) on entities it may not be
    /// subscribed to. Presence turns on with an immediate heartbeat and off
    /// with a leave.
    pub(crate) async fn set_presence(
        &self,
        connected: bool,
        channels: Vec<String>,
        groups: Vec<String>,
    ) -> Status {
        if channels.is_empty() && groups.is_empty() {
            return Status::failure(
                StatusCategory::BadRequest,
                Operation::Heartbeat,
                Error::Configuration("no channels or groups given".to_string()),
            );
        }
        {
            let mut manual = self.manual.lock().unwrap_or_else(PoisonError::into_inner);
            if connected {
                manual.channels.extend(channels.iter().cloned());
                manual.groups.extend(groups.iter().cloned());
            } else {
                for c in &channels {
                    manual.channels.remove(c);
                }
                for g in &groups {
                    manual.groups.remove(g);
                }
            }
        }
        if connected {
            self.send_heartbeat(channels, groups).await
        } else {
            self.leave(channels, groups).await
        }
    }

    #[cfg(test)]
    pub(crate) fn manual_channels(&self) -> Vec<String> {
        self.manual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .iter()
            .cloned()
            .collect()
    }
}
