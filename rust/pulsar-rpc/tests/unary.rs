//! Unary calls end to end over the in-memory broker.

mod common;

use std::time::Duration;

use common::*;
use pulsar_rpc::prelude::*;
use pulsar_rpc::CallState;
use serde::{Deserialize, Serialize};

fn ping_table() -> ServiceTable {
    ServiceTable::new()
        .with(
            &echo("Ping", MethodKind::Unary),
            Handler::unary(|_ctx, request: String| async move {
                if request == "ping" {
                    Ok("pong".to_string())
                } else {
                    Err(Status::invalid_argument(format!("expected ping, got {request}")))
                }
            }),
        )
        .expect("table")
}

#[tokio::test]
async fn ping_pong_through_listener() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);

    let call = channel.new_call(&echo("Ping", MethodKind::Unary), CallOptions::new());
    let (listener, mut rx) = Recorder::new();
    call.start(listener, Metadata::new()).await.unwrap();
    call.send_message(&"ping".to_string()).await.unwrap();
    call.half_close().await.unwrap();

    let seen = until_closed(&mut rx).await;
    assert!(matches!(seen.first(), Some(Seen::Headers(_))));
    assert_eq!(messages(&seen), vec!["pong".to_string()]);
    assert!(close_status(&seen).is_ok());
    assert_eq!(call.state(), CallState::Completed);
    assert!(!channel.is_registered(&call.id()));
}

#[tokio::test]
async fn unary_helper_returns_the_response() {
    init_tracing();
    let broker = MemBroker::new();
    let (dispatcher, _serving) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);

    let reply = unary(
        &channel,
        &echo("Ping", MethodKind::Unary),
        &"ping".to_string(),
        CallOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(reply, "pong");

    assert_eq!(channel.in_flight(), 0);
    assert!(eventually(|| dispatcher.in_flight() == 0).await);
    let server = dispatcher.metrics();
    assert_eq!(server.calls_started, 1);
    assert_eq!(server.calls_completed, 1);
}

#[tokio::test]
async fn handler_error_status_reaches_the_client() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);

    let status = unary(
        &channel,
        &echo("Ping", MethodKind::Unary),
        &"hello".to_string(),
        CallOptions::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "expected ping, got hello");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);

    let call = channel.new_call(&echo("Missing", MethodKind::Unary), CallOptions::new());
    let (listener, mut rx) = Recorder::new();
    call.start(listener, Metadata::new()).await.unwrap();
    call.send_message(&"ping".to_string()).await.unwrap();
    call.half_close().await.unwrap();

    let seen = until_closed(&mut rx).await;
    assert!(messages(&seen).is_empty());
    assert_eq!(close_status(&seen).code(), Code::Unimplemented);
}

#[tokio::test]
async fn handler_panic_is_internal() {
    init_tracing();
    let broker = MemBroker::new();
    let table = ServiceTable::new()
        .with(
            &echo("Boom", MethodKind::Unary),
            Handler::unary(|_ctx, _request: String| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(String::new())
            }),
        )
        .unwrap();
    let (dispatcher, _serving) = serve(&broker, table).await;
    let channel = channel(&broker);

    let status = unary(
        &channel,
        &echo("Boom", MethodKind::Unary),
        &"x".to_string(),
        CallOptions::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(eventually(|| dispatcher.in_flight() == 0).await);
}

#[tokio::test]
async fn metadata_travels_both_ways() {
    init_tracing();
    let broker = MemBroker::new();
    let table = ServiceTable::new()
        .with(
            &echo("Whoami", MethodKind::ServerStreaming),
            Handler::server_streaming(|ctx, _request: String, responses| async move {
                let user = ctx.metadata().get_str("x-user").unwrap_or("nobody").to_string();
                assert_eq!(ctx.method(), "Echo/Whoami");
                responses
                    .send_headers(Metadata::new().with("x-served-by", "test"))
                    .await?;
                responses.send(&user).await
            }),
        )
        .unwrap();
    let (_dispatcher, _serving) = serve(&broker, table).await;
    let channel = channel(&broker);

    let options = CallOptions::new().with_metadata(Metadata::new().with("X-User", "ada"));
    let mut responses = server_streaming(
        &channel,
        &echo("Whoami", MethodKind::ServerStreaming),
        &String::new(),
        options,
    )
    .await
    .unwrap();

    assert_eq!(responses.message().await.unwrap(), Some("ada".to_string()));
    assert_eq!(responses.message().await.unwrap(), None);
    assert_eq!(
        responses.headers().and_then(|h| h.get_str("x-served-by")),
        Some("test")
    );
    assert!(responses.status().is_some_and(Status::is_ok));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
    y: i32,
}

#[tokio::test]
async fn postcard_structs_round_trip() {
    init_tracing();
    let broker = MemBroker::new();
    let flip = MethodDescriptor::new(
        "Geometry",
        "Flip",
        MethodKind::Unary,
        codec::postcard::<Point>(),
        codec::postcard::<Point>(),
    );
    let table = ServiceTable::new()
        .with(
            &flip,
            Handler::unary(|_ctx, p: Point| async move { Ok(Point { x: p.y, y: p.x }) }),
        )
        .unwrap();
    let (_dispatcher, _serving) = serve(&broker, table).await;
    let channel = channel(&broker);

    let reply = unary(&channel, &flip, &Point { x: 1, y: -2 }, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(reply, Point { x: -2, y: 1 });
}

#[tokio::test]
async fn calls_share_one_reply_subscription_per_service() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);
    let ping = echo("Ping", MethodKind::Unary);

    let calls = (0..8).map(|_| {
        let channel = channel.clone();
        let ping = ping.clone();
        tokio::spawn(async move {
            unary(&channel, &ping, &"ping".to_string(), CallOptions::new()).await
        })
    });
    for call in calls.collect::<Vec<_>>() {
        assert_eq!(call.await.unwrap().unwrap(), "pong");
    }

    assert_eq!(channel.in_flight(), 0);
    assert!(eventually(|| channel.reply_subscriptions() == 0).await);
    let reply_topic = format!("Echo.replies.{}", channel.client_id());
    assert!(eventually(|| broker.consumers(&reply_topic, channel.client_id()) == 0).await);
}

#[tokio::test]
async fn two_dispatchers_split_the_request_topic() {
    init_tracing();
    let broker = MemBroker::new();
    let (first, _a) = serve(&broker, ping_table()).await;
    let (second, _b) = serve(&broker, ping_table()).await;
    let channel = channel(&broker);

    // Request envelopes are keyed by correlation id, so each call stays on
    // one dispatcher while calls spread over both.
    for _ in 0..32 {
        let reply = unary(
            &channel,
            &echo("Ping", MethodKind::Unary),
            &"ping".to_string(),
            CallOptions::new().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        assert_eq!(reply, "pong");
    }

    let served = first.metrics().calls_completed + second.metrics().calls_completed;
    assert_eq!(served, 32);
    assert!(first.metrics().calls_completed > 0);
    assert!(second.metrics().calls_completed > 0);
}
