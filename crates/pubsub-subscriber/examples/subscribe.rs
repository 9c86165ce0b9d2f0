//! Subscribe to one or more channels and print what arrives.
//!
//! ```sh
//! cargo run -p pubsub-subscriber --example subscribe -- <SUBSCRIBE_KEY> <CHANNEL>...
//! ```
//!
//! Or pass the subscribe key via environment variable:
//! ```sh
//! PUBSUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubsub-subscriber --example subscribe \
//!     -- <CHANNEL>...
//! ```
//!
//! Message payloads are printed to stdout as JSON lines (pipe to `jq` for
//! formatting); statuses and presence go to stderr.

use std::sync::Arc;

use pubsub_subscriber::{
    ClientConfig, Event, EventStream, Notification, SubscribeClient, SubscribeRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let subscribe_key = match std::env::var("PUBSUB_SUBSCRIBE_KEY") {
        Ok(key) => key,
        Err(_) => {
            if args.is_empty() {
                return Err("usage: subscribe <SUBSCRIBE_KEY> <CHANNEL>...".into());
            }
            args.remove(0)
        }
    };
    if args.is_empty() {
        return Err("usage: subscribe [SUBSCRIBE_KEY] <CHANNEL>...".into());
    }

    let user_id = format!("demo-{}", std::process::id());
    let mut config = ClientConfig::new(subscribe_key, user_id);
    config.presence_heartbeat_value = Some(60);

    let client = SubscribeClient::with_http(config)?;
    let stream = Arc::new(EventStream::new());
    client.add_listener(&stream);

    eprintln!("subscribing to {args:?} ...");
    let pending = client.subscribe(SubscribeRequest::channels(args).with_presence());
    tokio::spawn(async move {
        let status = pending.status().await;
        eprintln!("[subscribe] {:?}", status.category);
    });

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(item) = item else { break };
        match item {
            Notification::Event(Event::Message(msg)) | Notification::Event(Event::Signal(msg)) => {
                eprintln!(
                    "[message] channel={} publisher={} tt={}",
                    msg.channel,
                    msg.publisher.as_deref().unwrap_or("-"),
                    msg.timetoken,
                );
                println!("{}", msg.payload);
            }
            Notification::Event(Event::Presence(p)) => {
                eprintln!(
                    "[presence] channel={} action={:?} uuid={} occupancy={}",
                    p.channel,
                    p.action,
                    p.uuid.as_deref().unwrap_or("-"),
                    p.occupancy.map_or_else(|| "-".to_string(), |o| o.to_string()),
                );
            }
            Notification::Event(other) => {
                eprintln!("[event] channel={} tt={}", other.channel(), other.timetoken());
            }
            Notification::Status(status) => {
                eprintln!(
                    "[status] {:?} cursor={} error={}",
                    status.category,
                    status.current_cursor,
                    status
                        .error
                        .as_ref()
                        .map_or_else(|| "-".to_string(), ToString::to_string),
                );
            }
        }
    }

    client.unsubscribe_all().status().await;
    Ok(())
}
