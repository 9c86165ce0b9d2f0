//! Subscribe engine for a hosted publish/subscribe service.
//!
//! Maintains a long-poll against the service's subscribe endpoint, tracks the
//! subscribed channels, channel groups and their presence shadows, advances
//! the stream cursor (timetoken), and fans received events out to listeners
//! in order.
//!
//! # Features
//! - Subscribe / unsubscribe at any time; in-flight long-polls are cancelled
//!   so the next request reflects the new set immediately
//! - Automatic retry with linear or exponential backoff
//! - Catch-up on restore: resume from the pre-disconnect cursor
//! - Presence heartbeat, leave announcements and manual presence
//! - Pluggable [`Transport`] and [`Codec`]; reqwest and JSON provided
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_subscriber::Error> {
//! use std::sync::Arc;
//! use pubsub_subscriber::{
//!     ClientConfig, Event, EventStream, Notification, SubscribeClient, SubscribeRequest,
//! };
//!
//! let client = SubscribeClient::with_http(ClientConfig::new("sub-key", "user-1"))?;
//! let stream = Arc::new(EventStream::new());
//! client.add_listener(&stream);
//!
//! let status = client
//!     .subscribe(SubscribeRequest::channels(["chat"]).with_presence())
//!     .status()
//!     .await;
//! println!("subscribe: {:?}", status.category);
//!
//! while let Some(item) = stream.next().await {
//!     match item {
//!         Notification::Event(Event::Message(msg)) => println!("got: {}", msg.payload),
//!         Notification::Status(status) => println!("status: {:?}", status.category),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod cursor;
mod entity;
mod error;
mod event;
mod heartbeat;
mod listener;
mod protocol;
mod request;
mod retry;
mod status;
mod subscribe_loop;
mod subscription_set;
mod transport;

pub use client::{PendingStatus, SubscribeClient, SubscribeRequest, UnsubscribeRequest};
pub use config::{ClientConfig, HeartbeatNotify, TimingConfig};
pub use cursor::Cursor;
pub use entity::{Entity, PRESENCE_SUFFIX};
pub use error::{Error, Result};
pub use event::{
    Event, FileEvent, Message, MessageActionEvent, ObjectsEvent, PresenceAction, PresenceEvent,
};
pub use listener::{EventStream, Listener, Notification};
pub use protocol::{Codec, JsonCodec, ServiceError, SubscribeBatch, message_type};
pub use retry::{Backoff, Endpoint, RetryPolicy};
pub use status::{ConnectionState, Operation, Status, StatusCategory};
pub use subscription_set::{SubscriptionSet, SubscriptionSnapshot};
pub use transport::{HttpTransport, Request, Response, Transport, TransportError};
