use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use pubsub_subscriber::{
    ClientConfig, Endpoint, EventStream, HttpTransport, JsonCodec, Notification, Request,
    StatusCategory, SubscribeClient, SubscribeRequest, Transport, TransportError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get(path: &[&str], query: &[(&str, &str)], timeout: Duration) -> Request {
    Request {
        path: path.iter().map(|s| s.to_string()).collect(),
        query: query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        timeout,
        endpoint: Endpoint::Subscribe,
    }
}

fn local_config(port: u16) -> ClientConfig {
    let mut config = ClientConfig::new("demo", "user-1");
    config.origin = format!("127.0.0.1:{port}");
    config.secure = false;
    config.timing.reachability_probe_interval = None;
    config
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sends_path_and_query() {
    let http = MockServer::start();
    let mock = http.mock(|when, then| {
        when.method(GET)
            .path("/v2/subscribe/demo/chat,chat-pnpres/0")
            .query_param("tt", "0")
            .query_param("state", r#"{"chat":{"mood":"calm"}}"#);
        then.status(200).body(r#"{"t":{"t":"1","r":1},"m":[]}"#);
    });

    let transport = HttpTransport::new(&http.base_url()).unwrap();
    let response = transport
        .send(get(
            &["v2", "subscribe", "demo", "chat,chat-pnpres", "0"],
            &[("tt", "0"), ("state", r#"{"chat":{"mood":"calm"}}"#)],
            Duration::from_secs(5),
        ))
        .await
        .unwrap();

    mock.assert();
    assert!(response.is_success());
    assert_eq!(response.body, br#"{"t":{"t":"1","r":1},"m":[]}"#.to_vec());
}

#[tokio::test]
async fn error_status_is_a_response() {
    let http = MockServer::start();
    http.mock(|when, then| {
        when.method(GET).path("/time/0");
        then.status(403)
            .body(r#"{"status":403,"message":"Forbidden","error":true}"#);
    });

    let transport = HttpTransport::new(&http.base_url()).unwrap();
    let response = transport
        .send(get(&["time", "0"], &[], Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response.status, 403);
    assert!(!response.is_success());
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    let transport = HttpTransport::new("http://127.0.0.1:1").unwrap();
    let err = transport
        .send(get(&["time", "0"], &[], Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)), "got {err:?}");
}

#[tokio::test]
async fn slow_response_times_out() {
    let http = MockServer::start();
    http.mock(|when, then| {
        when.method(GET).path("/time/0");
        then.status(200).delay(Duration::from_secs(3)).body("[1]");
    });

    let transport = HttpTransport::new(&http.base_url()).unwrap();
    let err = transport
        .send(get(&["time", "0"], &[], Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn cancel_all_aborts_in_flight_requests() {
    let http = MockServer::start();
    http.mock(|when, then| {
        when.method(GET).path("/time/0");
        then.status(200).delay(Duration::from_secs(3)).body("[1]");
    });

    let transport = Arc::new(HttpTransport::new(&http.base_url()).unwrap());
    let in_flight = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .send_long_poll(get(&["time", "0"], &[], Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.cancel_all();

    let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("request should be aborted promptly")
        .unwrap();
    assert_eq!(result.unwrap_err(), TransportError::Cancelled);
}

// ---------------------------------------------------------------------------
// Client over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_connects_over_http() {
    let http = MockServer::start();
    let handshake = http.mock(|when, then| {
        when.method(GET)
            .path("/v2/subscribe/demo/chat/0")
            .query_param("tt", "0")
            .query_param("uuid", "user-1");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"t":{"t":"15000000000000000","r":4},"m":[]}"#);
    });
    // Every later long-poll idles until the test ends.
    http.mock(|when, then| {
        when.method(GET)
            .path("/v2/subscribe/demo/chat/0")
            .query_param("tt", "15000000000000000");
        then.status(200)
            .delay(Duration::from_secs(30))
            .body(r#"{"t":{"t":"15000000000000001","r":4},"m":[]}"#);
    });

    let client = SubscribeClient::new(
        local_config(http.port()),
        Arc::new(HttpTransport::new(&http.base_url()).unwrap()),
        Arc::new(JsonCodec),
    )
    .unwrap();
    let stream = Arc::new(EventStream::new());
    client.add_listener(&stream);

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        client.subscribe(SubscribeRequest::channels(["chat"])).status(),
    )
    .await
    .unwrap();
    assert_eq!(status.category, StatusCategory::Connected);
    handshake.assert();

    match stream.next().await {
        Some(Notification::Status(status)) => {
            assert_eq!(status.category, StatusCategory::Connected);
            assert_eq!(status.current_cursor.region, Some(4));
        }
        other => panic!("expected Connected, got {other:?}"),
    }
}
