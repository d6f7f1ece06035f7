//! Integration tests for the HTTP transport against connection level faults.
//!
//! Wiremock only speaks well-formed HTTP, so these tests use the raw TCP
//! fault server to produce garbage, truncated bodies, closed sockets and
//! stalled handshakes.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use ferry_delivery::{
    client::{ClientConfig, DeliveryAttempt, DeliveryClient},
    FailureKind, RawResult, Transport,
};
use ferry_testing::{payload, Fault, FaultServer};
use http::HeaderMap;
use uuid::Uuid;

fn attempt(url: &str, body: Bytes) -> DeliveryAttempt {
    DeliveryAttempt {
        attempt_id: Uuid::new_v4(),
        url: url.parse().unwrap(),
        headers: HeaderMap::new(),
        body,
    }
}

fn client(connect_timeout: Duration, request_timeout: Duration) -> DeliveryClient {
    DeliveryClient::new(ClientConfig::new(connect_timeout, request_timeout))
        .expect("client should build")
}

fn failure_kind(result: RawResult) -> FailureKind {
    match result {
        RawResult::Failed(failure) => failure.kind(),
        RawResult::Response(response) => {
            panic!("expected a transport failure, got status {}", response.status_code)
        },
    }
}

#[tokio::test]
async fn garbage_response_is_a_transport_failure() {
    let server = FaultServer::start(vec![Fault::GarbageThenClose]).await.unwrap();
    let client = client(Duration::from_secs(2), Duration::from_secs(2));

    let result = client.send(&attempt(&server.url(), payload("NETWORK_ERROR"))).await.unwrap();

    let kind = failure_kind(result);
    assert!(matches!(kind, FailureKind::Malformed | FailureKind::Reset), "got {kind}");
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn truncated_body_is_a_transport_failure_despite_200() {
    let server = FaultServer::start(vec![Fault::TruncatedResponse]).await.unwrap();
    let client = client(Duration::from_secs(2), Duration::from_secs(2));

    let result = client.send(&attempt(&server.url(), payload("NETWORK_ERROR"))).await.unwrap();

    let kind = failure_kind(result);
    assert!(matches!(kind, FailureKind::Malformed | FailureKind::Reset), "got {kind}");
}

#[tokio::test]
async fn closed_socket_is_a_transport_failure() {
    let server = FaultServer::start(vec![Fault::CloseWithoutResponse]).await.unwrap();
    let client = client(Duration::from_secs(2), Duration::from_secs(2));

    let result = client.send(&attempt(&server.url(), payload("NETWORK_ERROR"))).await.unwrap();

    let kind = failure_kind(result);
    assert!(matches!(kind, FailureKind::Malformed | FailureKind::Reset), "got {kind}");
}

#[tokio::test]
async fn stalled_handshake_hits_connect_timeout_not_request_timeout() {
    let server = FaultServer::stalled(Vec::new()).await.unwrap();
    let client = client(Duration::from_millis(300), Duration::from_secs(30));

    let started = std::time::Instant::now();
    let result = client.send(&attempt(&server.url(), payload("SLOW_SOCKET"))).await.unwrap();

    assert_eq!(failure_kind(result), FailureKind::ConnectTimeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn stalled_server_serves_after_resuming() {
    let server = FaultServer::stalled(Vec::new()).await.unwrap();
    let client = client(Duration::from_millis(300), Duration::from_secs(5));

    let first = client.send(&attempt(&server.url(), payload("SLOW_SOCKET"))).await.unwrap();
    assert_eq!(failure_kind(first), FailureKind::ConnectTimeout);

    server.resume_accepting().await;

    let second = client.send(&attempt(&server.url(), payload("SLOW_SOCKET"))).await.unwrap();
    match second {
        RawResult::Response(response) => assert_eq!(response.status_code, 200),
        RawResult::Failed(failure) => panic!("expected response after resume, got {failure}"),
    }
    assert_eq!(server.received_bodies(), vec![payload("SLOW_SOCKET")]);
}

#[tokio::test]
async fn delayed_response_hits_request_timeout() {
    let server =
        FaultServer::start(vec![Fault::Delayed(Duration::from_secs(3), 200)]).await.unwrap();
    let client = client(Duration::from_secs(2), Duration::from_millis(300));

    let result = client.send(&attempt(&server.url(), payload("SLOW_RESPONSE"))).await.unwrap();

    assert_eq!(failure_kind(result), FailureKind::RequestTimeout);
}
