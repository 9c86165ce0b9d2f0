//! The subscribe loop: owns the cursor, runs the long-poll cycle, and turns
//! every outcome into either the next request, a backoff, or a stop.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::cursor::Cursor;
use crate::entity::Entity;
use crate::error::Error;
use crate::heartbeat::Heartbeat;
use crate::listener::ListenerRegistry;
use crate::protocol::{Codec, SubscribeBatch};
use crate::request;
use crate::retry::Endpoint;
use crate::status::{ConnectionState, Operation, Status, StatusCategory};
use crate::subscription_set::SubscriptionSet;
use crate::transport::{Response, Transport, TransportError};

/// Number of consecutive undecodable responses that resets the cursor.
const MALFORMED_RESET_THRESHOLD: u32 = 2;

// ---------------------------------------------------------------------------
// Commands and shared read-side state
// ---------------------------------------------------------------------------

/// Instruction serialised onto the loop task. The subscription set has
/// already been mutated by the caller; the command carries what changed.
pub(crate) enum Command {
    Subscribe {
        added: Vec<Entity>,
        timetoken: Option<u64>,
        done: oneshot::Sender<Status>,
    },
    Unsubscribe {
        removed: Vec<Entity>,
        done: oneshot::Sender<Status>,
    },
    UnsubscribeAll {
        removed: Vec<Entity>,
        done: oneshot::Sender<Status>,
    },
    Restore {
        done: oneshot::Sender<Status>,
    },
    Cancel {
        done: oneshot::Sender<Status>,
    },
}

/// Cursor and connection state as last published by the loop.
#[derive(Debug)]
pub(crate) struct LoopState {
    inner: Mutex<(Cursor, ConnectionState)>,
}

impl LoopState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new((Cursor::ZERO, ConnectionState::Idle)),
        }
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    fn publish(&self, cursor: Cursor, state: ConnectionState) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (cursor, state);
    }
}

/// Collaborators the loop is built from.
pub(crate) struct LoopContext {
    pub config: Arc<ClientConfig>,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub subscriptions: Arc<SubscriptionSet>,
    pub heartbeat: Arc<Heartbeat>,
    pub listeners: ListenerRegistry,
    pub shared: Arc<LoopState>,
}

// ---------------------------------------------------------------------------
// Loop phases
// ---------------------------------------------------------------------------

type Outcome = Result<Response, TransportError>;
type InFlight = Pin<Box<dyn Future<Output = Outcome> + Send>>;

enum Phase {
    /// Nothing scheduled; only commands wake the loop.
    Idle,
    Polling { request: InFlight },
    Backoff { until: Instant },
    ProbeWait { until: Instant },
    Probing { request: InFlight },
}

enum Wake {
    Command(Command),
    Polled(Outcome),
    RetryDue,
    ProbeDue,
    Probed(Outcome),
}

async fn wait(phase: &mut Phase) -> Wake {
    match phase {
        Phase::Idle => std::future::pending().await,
        Phase::Polling { request } => Wake::Polled(request.await),
        Phase::Backoff { until } => {
            tokio::time::sleep_until(*until).await;
            Wake::RetryDue
        }
        Phase::ProbeWait { until } => {
            tokio::time::sleep_until(*until).await;
            Wake::ProbeDue
        }
        Phase::Probing { request } => Wake::Probed(request.await),
    }
}

// ---------------------------------------------------------------------------
// Subscribe loop
// ---------------------------------------------------------------------------

pub(crate) struct SubscribeLoop {
    ctx: LoopContext,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    cursor: Cursor,
    /// Cursor to continue from once the `tt=0` handshake answers.
    resume_from: Option<Cursor>,
    state: ConnectionState,
    /// Owns the in-flight long-poll; replacing it cancels the request.
    phase: Phase,
    failures: u32,
    malformed: u32,
    /// An `UnexpectedDisconnect` went out and no success has followed yet.
    disconnect_reported: bool,
    pending: Vec<oneshot::Sender<Status>>,
}

impl SubscribeLoop {
    pub(crate) fn new(
        ctx: LoopContext,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            commands,
            shutdown,
            cursor: Cursor::ZERO,
            resume_from: None,
            state: ConnectionState::Idle,
            phase: Phase::Idle,
            failures: 0,
            malformed: 0,
            disconnect_reported: false,
            pending: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },
                wake = wait(&mut self.phase) => wake,
            };
            match wake {
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Polled(outcome) => {
                    self.phase = Phase::Idle;
                    self.handle_outcome(outcome);
                }
                Wake::RetryDue => self.issue_poll(),
                Wake::ProbeDue => self.issue_probe(),
                Wake::Probed(outcome) => self.handle_probe(outcome),
            }
        }
        self.phase = Phase::Idle;
        self.ctx.transport.cancel_all();
        self.set_state(ConnectionState::Idle);
        tracing::debug!("subscribe loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                added,
                timetoken,
                done,
            } => self.on_subscribe(added, timetoken, done),
            Command::Unsubscribe { removed, done } => self.on_unsubscribe(removed, done, false).await,
            Command::UnsubscribeAll { removed, done } => {
                self.on_unsubscribe(removed, done, true).await
            }
            Command::Restore { done } => self.on_restore(Some(done)),
            Command::Cancel { done } => self.on_cancel(Some(done)),
        }
    }

    // ---- Commands ----

    fn on_subscribe(
        &mut self,
        added: Vec<Entity>,
        timetoken: Option<u64>,
        done: oneshot::Sender<Status>,
    ) {
        tracing::debug!(added = ?added, state = ?self.state, "subscribe requested");
        if self.ctx.subscriptions.is_empty() {
            let _ = done.send(Status::new(
                StatusCategory::Acknowledgment,
                Operation::Subscribe,
            ));
            return;
        }
        self.pending.push(done);

        if let Some(timetoken) = timetoken {
            self.resume_from = Some(Cursor::new(timetoken, None));
            self.begin_session(ConnectionState::Connecting);
            return;
        }

        match self.state {
            ConnectionState::Connected if self.ctx.config.keep_timetoken_on_list_change => {
                self.issue_poll();
                let status = self
                    .entity_status(StatusCategory::Connected)
                    .with_cursors(self.cursor, self.cursor);
                self.emit_and_settle(status);
            }
            ConnectionState::Reconnecting => {
                self.failures = 0;
                self.issue_poll();
            }
            ConnectionState::Connecting => self.issue_poll(),
            ConnectionState::Connected
            | ConnectionState::Idle
            | ConnectionState::Disconnected { .. } => {
                self.resume_from = None;
                self.disconnect_reported = false;
                self.begin_session(ConnectionState::Connecting);
            }
        }
    }

    async fn on_unsubscribe(&mut self, removed: Vec<Entity>, done: oneshot::Sender<Status>, all: bool) {
        tracing::debug!(removed = ?removed, all, "unsubscribe requested");
        if removed.is_empty() && !all {
            let _ = done.send(Status::new(
                StatusCategory::Acknowledgment,
                Operation::Unsubscribe,
            ));
            return;
        }

        // A pending backoff stays armed and retries against the reduced set.
        let restart = matches!(self.phase, Phase::Polling { .. });
        if restart {
            self.phase = Phase::Idle;
        }

        let (leave_channels, leave_groups) = regular_names(&removed);
        if !self.ctx.config.suppress_leave_events
            && (!leave_channels.is_empty() || !leave_groups.is_empty())
        {
            let heartbeat = Arc::clone(&self.ctx.heartbeat);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = heartbeat.leave(leave_channels, leave_groups) => {}
            }
        }

        let (channels, groups) = wire_names(&removed);
        let status = Status::new(StatusCategory::Disconnected, Operation::Unsubscribe)
            .with_cursors(self.cursor, self.cursor)
            .with_affected(channels, groups);

        if self.ctx.subscriptions.is_empty() {
            self.pending.push(done);
            self.terminate(status);
            return;
        }

        self.ctx.listeners.dispatch_status(status.clone());
        let _ = done.send(status);
        if !self.ctx.config.keep_timetoken_on_list_change
            && self.state == ConnectionState::Connected
        {
            self.cursor = Cursor::ZERO;
            self.set_state(ConnectionState::Connecting);
        }
        if restart {
            self.issue_poll();
        }
    }

    fn on_restore(&mut self, done: Option<oneshot::Sender<Status>>) {
        let ack = || Status::new(StatusCategory::Acknowledgment, Operation::Subscribe);
        let live = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) || matches!(self.phase, Phase::Polling { .. });
        if !self.ctx.config.restore_subscription || self.ctx.subscriptions.is_empty() || live {
            tracing::debug!(state = ?self.state, "nothing to restore");
            if let Some(done) = done {
                let _ = done.send(ack());
            }
            return;
        }

        if let Some(done) = done {
            self.pending.push(done);
        }
        if self.ctx.config.catch_up_on_restore && !self.cursor.is_zero() {
            self.resume_from = self.resume_from.or(Some(self.cursor));
        }
        tracing::info!(catch_up = ?self.resume_from, "restoring subscription");
        self.begin_session(ConnectionState::Reconnecting);
    }

    fn on_cancel(&mut self, done: Option<oneshot::Sender<Status>>) {
        tracing::info!(cursor = %self.cursor, "subscribe loop cancelled");
        self.phase = Phase::Idle;
        self.failures = 0;
        self.malformed = 0;
        if let Some(done) = done {
            self.pending.push(done);
        }
        self.set_state(ConnectionState::Idle);
        let status = Status::failure(
            StatusCategory::Cancelled,
            Operation::Subscribe,
            Error::Cancelled,
        )
        .with_cursors(self.cursor, self.cursor);
        self.emit_and_settle(status);
    }

    // ---- Long-poll outcomes ----

    fn handle_outcome(&mut self, outcome: Outcome) {
        let decoded = request::classify(self.ctx.codec.as_ref(), outcome)
            .and_then(|body| self.ctx.codec.decode(&body));
        match decoded {
            Ok(batch) => self.on_batch(batch),
            Err(Error::Decode(reason) | Error::MalformedResponse(reason)) => {
                self.on_malformed(reason)
            }
            Err(Error::Cancelled) => self.on_cancel(None),
            Err(e) if e.is_retryable() => self.on_retryable(e),
            Err(Error::AccessDenied {
                message,
                channels,
                groups,
            }) => self.on_access_denied(message, channels, groups),
            Err(e) => self.on_rejected(e),
        }
    }

    fn on_batch(&mut self, batch: SubscribeBatch) {
        self.failures = 0;
        self.malformed = 0;
        let resumed = self.resume_from.take();
        let previous = resumed.unwrap_or(self.cursor);
        let next = match resumed {
            Some(target) => Cursor::new(target.timetoken, batch.cursor.region),
            None if batch.cursor.timetoken < self.cursor.timetoken => {
                tracing::warn!(
                    current = %self.cursor,
                    received = %batch.cursor,
                    "service returned an older cursor, keeping current position"
                );
                Cursor::new(self.cursor.timetoken, batch.cursor.region)
            }
            None => batch.cursor,
        };

        let transition = match self.state {
            ConnectionState::Connected => None,
            ConnectionState::Connecting if !self.disconnect_reported => {
                Some(StatusCategory::Connected)
            }
            _ => Some(StatusCategory::Reconnected),
        };
        if let Some(category) = transition {
            tracing::info!(cursor = %next, ?category, "subscribe loop connected");
            self.disconnect_reported = false;
            self.state = ConnectionState::Connected;
            let status = self.entity_status(category).with_cursors(next, previous);
            self.emit_and_settle(status);
        }

        let events = match resumed {
            // Replayed from the stored cursor.
            Some(_) if !batch.events.is_empty() => {
                tracing::debug!(
                    skipped = batch.events.len(),
                    "ignoring events in the catch-up handshake"
                );
                Vec::new()
            }
            _ => batch.events,
        };
        let count = events.len();
        if count > 0 {
            tracing::trace!(count, cursor = %next, "dispatching events");
        }
        for event in events {
            self.ctx.listeners.dispatch_event(event);
        }
        let threshold = self.ctx.config.request_message_count_threshold;
        if threshold > 0 && count >= threshold {
            tracing::warn!(count, threshold, "message count threshold exceeded");
            let status = self
                .entity_status(StatusCategory::RequestMessageCountExceeded)
                .with_cursors(next, previous);
            self.ctx.listeners.dispatch_status(status);
        }

        // Events are queued for dispatch before the cursor moves past them.
        self.cursor = next;
        self.set_state(ConnectionState::Connected);
        self.issue_poll();
    }

    fn on_malformed(&mut self, reason: String) {
        self.malformed += 1;
        if self.malformed < MALFORMED_RESET_THRESHOLD {
            tracing::warn!(attempt = self.malformed, "malformed long-poll response, retrying: {reason}");
            self.issue_poll();
            return;
        }

        tracing::warn!(cursor = %self.cursor, "repeated malformed responses, resetting cursor: {reason}");
        self.malformed = 0;
        let previous = self.cursor;
        self.cursor = Cursor::ZERO;
        self.resume_from = None;
        self.failures += 1;
        let status = Status::failure(
            StatusCategory::MalformedResponse,
            Operation::Subscribe,
            Error::MalformedResponse(reason),
        )
        .with_cursors(Cursor::ZERO, previous);

        match self.retry_delay() {
            Some(delay) => {
                self.ctx.listeners.dispatch_status(status.retryable(true));
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::Reconnecting;
                }
                self.set_state(self.state);
                self.phase = Phase::Backoff {
                    until: Instant::now() + delay,
                };
            }
            None => self.give_up(status.retryable(false)),
        }
    }

    fn on_retryable(&mut self, error: Error) {
        self.failures += 1;
        self.malformed = 0;
        let attempt = self.failures;
        let category = match error {
            Error::RateLimited => StatusCategory::RateLimited,
            _ => StatusCategory::UnexpectedDisconnect,
        };
        match self.retry_delay() {
            Some(delay) => {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    cursor = %self.cursor,
                    "long-poll failed, retrying: {error}"
                );
                if !self.disconnect_reported {
                    self.disconnect_reported = true;
                    let status = Status::failure(category, Operation::Subscribe, error)
                        .with_cursors(self.cursor, self.cursor)
                        .retryable(true);
                    self.ctx.listeners.dispatch_status(status);
                }
                self.set_state(ConnectionState::Reconnecting);
                self.phase = Phase::Backoff {
                    until: Instant::now() + delay,
                };
            }
            None => {
                tracing::error!(attempt, "long-poll failed, giving up: {error}");
                let status = Status::failure(
                    StatusCategory::UnexpectedDisconnect,
                    Operation::Subscribe,
                    error,
                )
                .with_cursors(self.cursor, self.cursor)
                .retryable(false);
                self.give_up(status);
            }
        }
    }

    fn on_access_denied(&mut self, message: String, channels: Vec<String>, groups: Vec<String>) {
        self.malformed = 0;
        let named: Vec<Entity> = channels
            .iter()
            .cloned()
            .map(Entity::channel)
            .chain(groups.iter().cloned().map(Entity::group))
            .collect();
        let mut removed = self.ctx.subscriptions.remove(&named);
        if removed.is_empty() {
            // Nothing we hold was named: the whole request was refused.
            removed = self.ctx.subscriptions.clear();
        }
        let (channels, groups) = wire_names(&removed);
        tracing::warn!(channels = ?channels, groups = ?groups, "access denied: {message}");
        let status = Status::failure(
            StatusCategory::AccessDenied,
            Operation::Subscribe,
            Error::AccessDenied {
                message,
                channels: channels.clone(),
                groups: groups.clone(),
            },
        )
        .with_cursors(self.cursor, self.cursor)
        .with_affected(channels, groups);

        if self.ctx.subscriptions.is_empty() {
            self.terminate(status);
        } else {
            self.emit_and_settle(status);
            self.issue_poll();
        }
    }

    fn on_rejected(&mut self, error: Error) {
        let category = match &error {
            Error::BadRequest { status: 414, .. } => StatusCategory::RequestURITooLong,
            Error::BadRequest {
                status: 400,
                message,
            } if self.ctx.config.filter_expression.is_some()
                && message.to_ascii_lowercase().contains("filter") =>
            {
                StatusCategory::MalformedFilterExpression
            }
            other => StatusCategory::for_error(other),
        };
        tracing::error!(?category, "long-poll rejected, stopping: {error}");
        self.malformed = 0;
        let status = Status::failure(category, Operation::Subscribe, error)
            .with_cursors(self.cursor, self.cursor);
        self.phase = Phase::Idle;
        self.set_state(ConnectionState::Idle);
        self.emit_and_settle(status);
    }

    // ---- Reachability probe ----

    fn issue_probe(&mut self) {
        tracing::trace!("probing service reachability");
        let req = request::time(&self.ctx.config);
        let transport = Arc::clone(&self.ctx.transport);
        self.phase = Phase::Probing {
            request: Box::pin(async move { transport.send(req).await }),
        };
    }

    fn handle_probe(&mut self, outcome: Outcome) {
        self.phase = Phase::Idle;
        match request::classify(self.ctx.codec.as_ref(), outcome) {
            Ok(_) => {
                tracing::info!("service reachable again");
                self.on_restore(None);
            }
            Err(e) => {
                tracing::trace!("service still unreachable: {e}");
                self.schedule_probe();
            }
        }
    }

    fn schedule_probe(&mut self) {
        self.phase = match self.ctx.config.timing.reachability_probe_interval {
            Some(interval) if self.ctx.config.restore_subscription => Phase::ProbeWait {
                until: Instant::now() + interval,
            },
            _ => Phase::Idle,
        };
    }

    // ---- Helpers ----

    /// Starts a fresh `tt=0` session in `state`.
    fn begin_session(&mut self, state: ConnectionState) {
        self.cursor = Cursor::ZERO;
        self.failures = 0;
        self.malformed = 0;
        self.set_state(state);
        self.issue_poll();
    }

    fn issue_poll(&mut self) {
        let snapshot = self.ctx.subscriptions.snapshot();
        if snapshot.is_empty() {
            self.phase = Phase::Idle;
            return;
        }
        let req = match request::subscribe(
            &self.ctx.config,
            self.ctx.codec.as_ref(),
            &snapshot,
            self.cursor,
        ) {
            Ok(req) => req,
            Err(e) => {
                self.on_rejected(e);
                return;
            }
        };
        tracing::debug!(
            cursor = %self.cursor,
            channels = ?snapshot.channels,
            groups = ?snapshot.groups,
            "issuing long-poll"
        );
        self.ctx.heartbeat.long_poll_issued();
        let transport = Arc::clone(&self.ctx.transport);
        self.phase = Phase::Polling {
            request: Box::pin(async move { transport.send_long_poll(req).await }),
        };
    }

    fn retry_delay(&self) -> Option<std::time::Duration> {
        self.ctx
            .config
            .retry
            .as_ref()
            .and_then(|policy| policy.delay(Endpoint::Subscribe, self.failures))
    }

    /// Retries exhausted: report, settle callers, and wait for a restore.
    fn give_up(&mut self, status: Status) {
        self.set_state(ConnectionState::Disconnected { unexpected: true });
        self.schedule_probe();
        self.emit_and_settle(status);
    }

    /// Stops the loop for good until the next subscribe.
    fn terminate(&mut self, status: Status) {
        self.phase = Phase::Idle;
        self.resume_from = None;
        self.failures = 0;
        self.malformed = 0;
        self.disconnect_reported = false;
        self.cursor = Cursor::ZERO;
        self.set_state(ConnectionState::Idle);
        self.emit_and_settle(status);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.ctx.shared.publish(self.cursor, state);
    }

    /// Status naming the regular entities currently subscribed.
    fn entity_status(&self, category: StatusCategory) -> Status {
        let snapshot = self.ctx.subscriptions.snapshot();
        Status::new(category, Operation::Subscribe).with_affected(snapshot.channels, snapshot.groups)
    }

    fn emit_and_settle(&mut self, status: Status) {
        self.ctx.listeners.dispatch_status(status.clone());
        for done in self.pending.drain(..) {
            let _ = done.send(status.clone());
        }
    }
}

/// Wire names split into channels and groups.
fn wire_names(entities: &[Entity]) -> (Vec<String>, Vec<String>) {
    let (groups, channels): (Vec<&Entity>, Vec<&Entity>) =
        entities.iter().partition(|e| e.is_group());
    (
        channels.into_iter().map(Entity::name).collect(),
        groups.into_iter().map(Entity::name).collect(),
    )
}

/// Like [`wire_names`], without presence shadows.
fn regular_names(entities: &[Entity]) -> (Vec<String>, Vec<String>) {
    let regular: Vec<Entity> = entities
        .iter()
        .filter(|e| !e.is_presence())
        .cloned()
        .collect();
    wire_names(&regular)
}
