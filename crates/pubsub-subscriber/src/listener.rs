//! Listener registry: weakly-held observers fed from one serial dispatch task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::event::{Event, FileEvent, Message, MessageActionEvent, ObjectsEvent, PresenceEvent};
use crate::status::Status;

/// Observer of subscribe-loop output. Every method defaults to a no-op, so an
/// implementation only overrides what it cares about.
///
/// Callbacks run on the registry's dispatch task, one at a time, in the order
/// the subscribe loop produced them. Keep them short; a slow listener delays
/// every listener behind it.
pub trait Listener: Send + Sync {
    fn on_message(&self, _message: &Message) {}

    fn on_signal(&self, _signal: &Message) {}

    fn on_presence(&self, _event: &PresenceEvent) {}

    fn on_status(&self, _status: &Status) {}

    fn on_objects_event(&self, _event: &ObjectsEvent) {}

    fn on_message_action(&self, _event: &MessageActionEvent) {}

    fn on_file(&self, _event: &FileEvent) {}
}

/// Item travelling through the dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Event(Event),
    Status(Status),
}

impl Notification {
    fn deliver(&self, listener: &dyn Listener) {
        match self {
            Notification::Status(status) => listener.on_status(status),
            Notification::Event(Event::Message(m)) => listener.on_message(m),
            Notification::Event(Event::Signal(s)) => listener.on_signal(s),
            Notification::Event(Event::Presence(p)) => listener.on_presence(p),
            Notification::Event(Event::Objects(o)) => listener.on_objects_event(o),
            Notification::Event(Event::MessageAction(a)) => listener.on_message_action(a),
            Notification::Event(Event::File(f)) => listener.on_file(f),
        }
    }
}

type Listeners = Mutex<Vec<Weak<dyn Listener>>>;

/// Cheap-to-clone handle to the listener list and its dispatch queue.
///
/// The registry holds listeners weakly: dropping the last `Arc` to a listener
/// unregisters it. The dispatch task ends once every handle is dropped and the
/// queue is drained.
#[derive(Clone)]
pub(crate) struct ListenerRegistry {
    listeners: Arc<Listeners>,
    queue: mpsc::UnboundedSender<Notification>,
}

impl ListenerRegistry {
    pub(crate) fn new(runtime: &tokio::runtime::Handle) -> Self {
        let listeners: Arc<Listeners> = Arc::new(Mutex::new(Vec::new()));
        let (queue, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_dispatch(Arc::clone(&listeners), rx));
        Self { listeners, queue }
    }

    /// Registers `listener`. Adding the same listener twice is a no-op.
    pub(crate) fn add<L: Listener + 'static>(&self, listener: &Arc<L>) {
        let weak = downgrade(listener);
        let mut list = self.lock();
        list.retain(|w| w.strong_count() > 0);
        if !list.iter().any(|w| same_listener(w, &weak)) {
            list.push(weak);
        }
    }

    /// Takes effect before the next queued item is dispatched.
    pub(crate) fn remove<L: Listener + 'static>(&self, listener: &Arc<L>) {
        let weak = downgrade(listener);
        self.lock()
            .retain(|w| w.strong_count() > 0 && !same_listener(w, &weak));
    }

    pub(crate) fn remove_all(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub(crate) fn dispatch_event(&self, event: Event) {
        self.enqueue(Notification::Event(event));
    }

    pub(crate) fn dispatch_status(&self, status: Status) {
        self.enqueue(Notification::Status(status));
    }

    fn enqueue(&self, item: Notification) {
        if self.queue.send(item).is_err() {
            tracing::debug!("listener dispatch task gone, dropping notification");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Weak<dyn Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn downgrade<L: Listener + 'static>(listener: &Arc<L>) -> Weak<dyn Listener> {
    let strong: Arc<dyn Listener> = listener.clone();
    Arc::downgrade(&strong)
}

fn same_listener(a: &Weak<dyn Listener>, b: &Weak<dyn Listener>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::addr_eq(a.as_ptr(), b.as_ptr())
}

async fn run_dispatch(listeners: Arc<Listeners>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(item) = rx.recv().await {
        // Snapshot under the lock: a removal either precedes this item entirely
        // or follows it entirely.
        let targets: Vec<Arc<dyn Listener>> = listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| item.deliver(listener.as_ref()))).is_err() {
                tracing::error!("listener panicked during dispatch");
            }
        }
    }
    tracing::trace!("listener dispatch task exiting");
}

// ---------------------------------------------------------------------------
// Pull-style adapter
// ---------------------------------------------------------------------------

/// Listener that queues everything it receives for pull-style consumption.
///
/// ```no_run
/// # async fn example(client: pubsub_subscriber::SubscribeClient) {
/// use std::sync::Arc;
/// use pubsub_subscriber::{EventStream, Notification};
///
/// let stream = Arc::new(EventStream::new());
/// client.add_listener(&stream);
/// while let Some(item) = stream.next().await {
///     if let Notification::Event(event) = item {
///         println!("{} @ {}", event.channel(), event.timetoken());
///     }
/// }
/// # }
/// ```
pub struct EventStream {
    tx: mpsc::UnboundedSender<Notification>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>,
}

impl EventStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Waits for the next notification.
    pub async fn next(&self) -> Option<Notification> {
        self.rx.lock().await.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_next(&self) -> Option<Notification> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    fn push(&self, item: Notification) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.tx.send(item);
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener for EventStream {
    fn on_message(&self, message: &Message) {
        self.push(Notification::Event(Event::Message(message.clone())));
    }

    fn on_signal(&self, signal: &Message) {
        self.push(Notification::Event(Event::Signal(signal.clone())));
    }

    fn on_presence(&self, event: &PresenceEvent) {
        self.push(Notification::Event(Event::Presence(event.clone())));
    }

    fn on_status(&self, status: &Status) {
        self.push(Notification::Status(status.clone()));
    }

    fn on_objects_event(&self, event: &ObjectsEvent) {
        self.push(Notification::Event(Event::Objects(event.clone())));
    }

    fn on_message_action(&self, event: &MessageActionEvent) {
        self.push(Notification::Event(Event::MessageAction(event.clone())));
    }

    fn on_file(&self, event: &FileEvent) {
        self.push(Notification::Event(Event::File(event.clone())));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::status::{Operation, StatusCategory};

    #[derive(Default)]
    struct MessageCounter {
        messages: AtomicUsize,
    }

    impl Listener for MessageCounter {
        fn on_message(&self, _message: &Message) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Listener for Panicky {
        fn on_message(&self, _message: &Message) {
            panic!("boom");
        }
    }

    fn message(tt: u64) -> Event {
        Event::Message(Message {
            channel: "a".into(),
            subscription: None,
            publisher: None,
            payload: json!(tt),
            timetoken: tt,
            metadata: None,
            message_type: None,
            space_id: None,
        })
    }

    async fn drain(stream: &EventStream, n: usize) -> Vec<Notification> {
        let mut out = Vec::new();
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn dispatch_preserves_order() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let stream = Arc::new(EventStream::new());
        registry.add(&stream);
        for tt in 1..=5 {
            registry.dispatch_event(message(tt));
        }
        let got: Vec<u64> = drain(&stream, 5)
            .await
            .into_iter()
            .map(|n| match n {
                Notification::Event(e) => e.timetoken(),
                Notification::Status(_) => 0,
            })
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_stops_delivery() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let counter = Arc::new(MessageCounter::default());
        let stream = Arc::new(EventStream::new());
        registry.add(&counter);
        registry.add(&counter);
        registry.add(&stream);
        assert_eq!(registry.len(), 2);

        registry.dispatch_event(message(1));
        drain(&stream, 1).await;
        assert_eq!(counter.messages.load(Ordering::SeqCst), 1);

        registry.remove(&counter);
        registry.dispatch_event(message(2));
        drain(&stream, 1).await;
        assert_eq!(counter.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_only_listener_ignores_other_kinds() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let counter = Arc::new(MessageCounter::default());
        let stream = Arc::new(EventStream::new());
        registry.add(&counter);
        registry.add(&stream);
        registry.dispatch_status(Status::new(StatusCategory::Connected, Operation::Subscribe));
        registry.dispatch_event(message(1));
        drain(&stream, 2).await;
        assert_eq!(counter.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_listener_is_released() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let counter = Arc::new(MessageCounter::default());
        registry.add(&counter);
        assert_eq!(registry.len(), 1);
        drop(counter);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_dispatch() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let panicky = Arc::new(Panicky);
        let stream = Arc::new(EventStream::new());
        registry.add(&panicky);
        registry.add(&stream);
        registry.dispatch_event(message(1));
        registry.dispatch_event(message(2));
        assert_eq!(drain(&stream, 2).await.len(), 2);
    }

    /// Removes `target` from the registry the first time it sees a message.
    struct Remover {
        registry: ListenerRegistry,
        target: Arc<MessageCounter>,
    }

    impl Listener for Remover {
        fn on_message(&self, _message: &Message) {
            self.registry.remove(&self.target);
        }
    }

    #[tokio::test]
    async fn removal_during_dispatch_completes_current_item() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let counter = Arc::new(MessageCounter::default());
        let remover = Arc::new(Remover {
            registry: registry.clone(),
            target: Arc::clone(&counter),
        });
        let stream = Arc::new(EventStream::new());
        registry.add(&remover);
        registry.add(&counter);
        registry.add(&stream);

        registry.dispatch_event(message(1));
        registry.dispatch_event(message(2));
        registry.dispatch_event(message(3));
        drain(&stream, 3).await;

        // Removed while item 1 was being delivered: it still gets item 1 and
        // nothing after it.
        assert_eq!(counter.messages.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn remove_all_clears_everything() {
        let registry = ListenerRegistry::new(&tokio::runtime::Handle::current());
        let stream = Arc::new(EventStream::new());
        registry.add(&stream);
        registry.remove_all();
        registry.dispatch_event(message(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.try_next().is_none());
    }
}
