//! Public entry point: [`SubscribeClient`] and its request types.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::cursor::Cursor;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::listener::{Listener, ListenerRegistry};
use crate::protocol::{Codec, JsonCodec};
use crate::status::{ConnectionState, Operation, Status, StatusCategory};
use crate::subscribe_loop::{Command, LoopContext, LoopState, SubscribeLoop};
use crate::subscription_set::SubscriptionSet;
use crate::transport::{HttpTransport, Transport};

/// Channels and groups to subscribe to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeRequest {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    /// Also subscribe to the presence shadow of every channel and group.
    pub with_presence: bool,
    /// Presence state attached to every channel and group in the request.
    pub state: Option<Value>,
    /// Resume from a previously stored timetoken instead of "now".
    pub timetoken: Option<u64>,
}

impl SubscribeRequest {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn with_presence(mut self) -> Self {
        self.with_presence = true;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_timetoken(mut self, timetoken: u64) -> Self {
        self.timetoken = Some(timetoken);
        self
    }

    fn entities(&self) -> Vec<Entity> {
        expand(&self.channels, &self.groups, self.with_presence)
    }
}

/// Channels and groups to unsubscribe from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    /// Also drop the presence shadows.
    pub with_presence: bool,
}

impl UnsubscribeRequest {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_presence(mut self) -> Self {
        self.with_presence = true;
        self
    }

    fn entities(&self) -> Vec<Entity> {
        expand(&self.channels, &self.groups, self.with_presence)
    }
}

fn expand(channels: &[String], groups: &[String], with_presence: bool) -> Vec<Entity> {
    let regular = channels
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| Entity::channel(c.as_str()))
        .chain(
            groups
                .iter()
                .filter(|g| !g.is_empty())
                .map(|g| Entity::group(g.as_str())),
        );
    let mut entities = Vec::new();
    for entity in regular {
        let shadow = if with_presence {
            entity.presence_shadow()
        } else {
            None
        };
        entities.push(entity);
        entities.extend(shadow);
    }
    entities
}

/// Completion of one subscribe-affecting operation.
///
/// The same [`Status`] is also delivered to every listener; awaiting this is
/// optional.
pub struct PendingStatus {
    rx: oneshot::Receiver<Status>,
    operation: Operation,
}

impl PendingStatus {
    fn new(operation: Operation) -> (oneshot::Sender<Status>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, operation })
    }

    fn ready(status: Status) -> Self {
        let (tx, pending) = Self::new(status.operation);
        let _ = tx.send(status);
        pending
    }

    /// Waits for the operation's terminal status. Yields a `Cancelled`
    /// status if the client shut down first.
    pub async fn status(self) -> Status {
        match self.rx.await {
            Ok(status) => status,
            Err(_) => Status::failure(StatusCategory::Cancelled, self.operation, Error::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Subscribe half of a pub/sub client.
///
/// Owns the subscription set, the subscribe loop task, the heartbeat task and
/// the listener registry. Dropping the client stops every task it started.
pub struct SubscribeClient {
    config: Arc<ClientConfig>,
    subscriptions: Arc<SubscriptionSet>,
    shared: Arc<LoopState>,
    listeners: ListenerRegistry,
    heartbeat: Arc<Heartbeat>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl SubscribeClient {
    /// Creates a client and starts its background tasks on the current tokio
    /// runtime.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Configuration("client must be created inside a tokio runtime".to_string())
        })?;
        let config = Arc::new(config);
        let callback_runtime = config
            .callback_runtime
            .clone()
            .unwrap_or_else(|| runtime.clone());

        let shutdown = CancellationToken::new();
        let subscriptions = Arc::new(SubscriptionSet::new());
        let shared = Arc::new(LoopState::new());
        let listeners = ListenerRegistry::new(&callback_runtime);
        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&config),
            Arc::clone(&transport),
            Arc::clone(&codec),
            Arc::clone(&subscriptions),
            listeners.clone(),
        ));
        heartbeat.spawn(&runtime, shutdown.child_token());

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let subscribe_loop = SubscribeLoop::new(
            LoopContext {
                config: Arc::clone(&config),
                transport,
                codec,
                subscriptions: Arc::clone(&subscriptions),
                heartbeat: Arc::clone(&heartbeat),
                listeners: listeners.clone(),
                shared: Arc::clone(&shared),
            },
            commands_rx,
            shutdown.child_token(),
        );
        runtime.spawn(subscribe_loop.run());
        tracing::debug!(user_id = %config.user_id, "subscribe client started");

        Ok(Self {
            config,
            subscriptions,
            shared,
            listeners,
            heartbeat,
            commands,
            shutdown,
        })
    }

    /// Client over [`HttpTransport`] and [`JsonCodec`].
    pub fn with_http(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::from_config(&config)?);
        Self::new(config, transport, Arc::new(JsonCodec))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- Subscription changes ----

    /// Adds the requested entities and (re)starts the long-poll. Returns
    /// immediately; the outcome arrives as a [`Status`].
    pub fn subscribe(&self, request: SubscribeRequest) -> PendingStatus {
        let entities = request.entities();
        if entities.is_empty() {
            return PendingStatus::ready(Status::failure(
                StatusCategory::BadRequest,
                Operation::Subscribe,
                Error::Configuration("no channels or groups to subscribe to".to_string()),
            ));
        }
        let added = self
            .subscriptions
            .add(entities, request.state.as_ref());
        let (done, pending) = PendingStatus::new(Operation::Subscribe);
        self.send(Command::Subscribe {
            added,
            timetoken: request.timetoken,
            done,
        });
        pending
    }

    /// Removes the requested entities, announces leave, and restarts the
    /// long-poll with what remains. An emptied set stops the loop.
    pub fn unsubscribe(&self, request: UnsubscribeRequest) -> PendingStatus {
        let removed = self.subscriptions.remove(&request.entities());
        let (done, pending) = PendingStatus::new(Operation::Unsubscribe);
        self.send(Command::Unsubscribe { removed, done });
        pending
    }

    pub fn unsubscribe_all(&self) -> PendingStatus {
        let removed = self.subscriptions.clear();
        let (done, pending) = PendingStatus::new(Operation::Unsubscribe);
        self.send(Command::UnsubscribeAll { removed, done });
        pending
    }

    /// Resumes a loop stopped by a disconnect or cancellation, if
    /// `restore_subscription` is configured.
    pub fn restore_if_needed(&self) -> PendingStatus {
        let (done, pending) = PendingStatus::new(Operation::Subscribe);
        self.send(Command::Restore { done });
        pending
    }

    /// Stops the long-poll without touching the subscription set or cursor.
    pub fn cancel(&self) -> PendingStatus {
        let (done, pending) = PendingStatus::new(Operation::Subscribe);
        self.send(Command::Cancel { done });
        pending
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("subscribe loop is not running");
        }
    }

    // ---- Presence ----

    /// Marks this client present (`connected = true`) or absent on channels
    /// and groups without subscribing to them.
    pub async fn set_presence(
        &self,
        connected: bool,
        channels: Vec<String>,
        groups: Vec<String>,
    ) -> Status {
        self.heartbeat.set_presence(connected, channels, groups).await
    }

    // ---- Read-side snapshots ----

    pub fn current_channels(&self) -> Vec<String> {
        self.subscriptions.snapshot().channels
    }

    pub fn current_channel_groups(&self) -> Vec<String> {
        self.subscriptions.snapshot().groups
    }

    /// Presence shadows of subscribed channels, with the `-pnpres` suffix.
    pub fn current_presence_channels(&self) -> Vec<String> {
        self.subscriptions.snapshot().presence_channels
    }

    /// `name` is a channel or group name; `-pnpres` names check presence.
    pub fn is_subscribed(&self, name: &str) -> bool {
        self.subscriptions.contains(&Entity::channel(name))
            || self.subscriptions.contains(&Entity::group(name))
    }

    pub fn cursor(&self) -> Cursor {
        self.shared.cursor()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    // ---- Listeners ----

    pub fn add_listener<L: Listener + 'static>(&self, listener: &Arc<L>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener<L: Listener + 'static>(&self, listener: &Arc<L>) {
        self.listeners.remove(listener);
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.remove_all();
    }
}

impl Drop for SubscribeClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
