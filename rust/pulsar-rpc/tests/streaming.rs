//! Streaming calls, with and without a misbehaving broker.

mod common;

use std::time::Duration;

use common::*;
use pulsar_rpc::prelude::*;
use pulsar_rpc::{CallError, CallState};

fn counter_table() -> ServiceTable {
    ServiceTable::new()
        .with(
            &counter("CountTo", MethodKind::ServerStreaming),
            Handler::server_streaming(|_ctx, n: u32, responses| async move {
                for i in 1..=n {
                    responses.send(&i).await?;
                }
                Ok(())
            }),
        )
        .and_then(|t| {
            t.with(
                &counter("Sum", MethodKind::ClientStreaming),
                Handler::client_streaming(|_ctx, mut requests: RequestStream<u32>| async move {
                    let mut sum = 0;
                    while let Some(n) = requests.message().await? {
                        sum += n;
                    }
                    Ok(sum)
                }),
            )
        })
        .and_then(|t| {
            t.with(
                &counter("Double", MethodKind::Bidirectional),
                Handler::bidi_streaming(
                    |_ctx, mut requests: RequestStream<u32>, responses: ResponseSink<u32>| async move {
                        while let Some(n) = requests.message().await? {
                            responses.send(&(n * 2)).await?;
                        }
                        Ok(())
                    },
                ),
            )
        })
        .expect("table")
}

/// Concatenates requests in the order the handler receives them.
fn collect_table() -> ServiceTable {
    ServiceTable::new()
        .with(
            &echo("Collect", MethodKind::ClientStreaming),
            Handler::client_streaming(|_ctx, mut requests: RequestStream<String>| async move {
                let mut seen = Vec::new();
                while let Some(part) = requests.message().await? {
                    seen.push(part);
                }
                Ok(seen.join(","))
            }),
        )
        .expect("table")
}

#[tokio::test]
async fn server_streaming_delivers_every_response_in_order() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let mut responses = server_streaming(
        &channel,
        &counter("CountTo", MethodKind::ServerStreaming),
        &5,
        CallOptions::new(),
    )
    .await
    .unwrap();

    let mut got = Vec::new();
    while let Some(n) = responses.message().await.unwrap() {
        got.push(n);
    }
    assert_eq!(got, vec![1, 2, 3, 4, 5]);
    assert!(responses.status().is_some_and(Status::is_ok));
}

#[tokio::test]
async fn client_streaming_sums_requests() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let (requests, response) = client_streaming(
        &channel,
        &counter("Sum", MethodKind::ClientStreaming),
        CallOptions::new(),
    )
    .await
    .unwrap();
    for n in 1..=10 {
        requests.send(&n).await.unwrap();
    }
    requests.close().await.unwrap();

    assert_eq!(response.await.unwrap(), 55);
}

#[tokio::test]
async fn long_client_stream_is_not_cut_short() {
    init_tracing();
    let broker = MemBroker::new();
    let (dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let (requests, response) = client_streaming(
        &channel,
        &counter("Sum", MethodKind::ClientStreaming),
        CallOptions::new().with_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();
    for n in 1..=500 {
        requests.send(&n).await.unwrap();
    }
    requests.close().await.unwrap();

    assert_eq!(response.await.unwrap(), 125_250);
    assert!(eventually(|| dispatcher.metrics().calls_completed == 1).await);
    assert_eq!(dispatcher.metrics().calls_failed, 0);
}

#[tokio::test]
async fn client_streaming_without_requests_still_completes() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let (requests, response) = client_streaming(
        &channel,
        &counter("Sum", MethodKind::ClientStreaming),
        CallOptions::new(),
    )
    .await
    .unwrap();
    requests.close().await.unwrap();

    assert_eq!(response.await.unwrap(), 0);
}

#[tokio::test]
async fn bidi_responds_while_requests_flow() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let (requests, mut responses) = bidi_streaming(
        &channel,
        &counter("Double", MethodKind::Bidirectional),
        CallOptions::new(),
    )
    .await
    .unwrap();

    // Each response arrives before the next request is sent.
    for n in [3, 5, 7] {
        requests.send(&n).await.unwrap();
        assert_eq!(responses.message().await.unwrap(), Some(n * 2));
    }
    requests.close().await.unwrap();
    assert_eq!(responses.message().await.unwrap(), None);
}

#[tokio::test]
async fn second_request_on_single_request_method_is_a_local_violation() {
    init_tracing();
    let broker = MemBroker::new();
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let call = channel.new_call(&counter("CountTo", MethodKind::ServerStreaming), CallOptions::new());
    let (listener, mut rx) = Recorder::new();
    call.start(listener, Metadata::new()).await.unwrap();
    call.send_message(&1).await.unwrap();
    let err = call.send_message(&2).await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)));

    let seen = until_closed(&mut rx).await;
    assert_eq!(close_status(&seen).code(), Code::Internal);
    assert_eq!(call.state(), CallState::Completed);
}

#[tokio::test]
async fn client_stream_order_survives_reordering_and_duplication() {
    init_tracing();
    let broker = MemBroker::with_faults(
        FaultConfig::default()
            .with_duplicate_rate(3000)
            .with_reorder(5000, Duration::from_millis(20)),
    );
    let (_dispatcher, _serving) = serve(&broker, collect_table()).await;
    let channel = channel(&broker);

    let parts: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    let (requests, response) = client_streaming(
        &channel,
        &echo("Collect", MethodKind::ClientStreaming),
        CallOptions::new().with_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();
    for part in &parts {
        requests.send(part).await.unwrap();
    }
    requests.close().await.unwrap();

    assert_eq!(response.await.unwrap(), parts.join(","));
    let stats = broker.stats();
    assert!(stats.duplicated > 0);
    assert!(stats.delayed > 0);
}

#[tokio::test]
async fn server_stream_order_survives_reordering_and_duplication() {
    init_tracing();
    let broker = MemBroker::with_faults(
        FaultConfig::default()
            .with_duplicate_rate(3000)
            .with_reorder(5000, Duration::from_millis(20)),
    );
    let (_dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);

    let mut responses = server_streaming(
        &channel,
        &counter("CountTo", MethodKind::ServerStreaming),
        &30,
        CallOptions::new().with_timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let mut got = Vec::new();
    while let Some(n) = responses.message().await.unwrap() {
        got.push(n);
    }
    assert_eq!(got, (1..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn many_concurrent_calls_under_faults() {
    init_tracing();
    let broker = MemBroker::with_faults(
        FaultConfig::default()
            .with_duplicate_rate(2000)
            .with_reorder(3000, Duration::from_millis(10)),
    );
    let (dispatcher, _serving) = serve(&broker, counter_table()).await;
    let channel = channel(&broker);
    let sum = counter("Sum", MethodKind::ClientStreaming);

    let calls: Vec<_> = (1..=16u32)
        .map(|n| {
            let channel = channel.clone();
            let sum = sum.clone();
            tokio::spawn(async move {
                let (requests, response) = client_streaming(
                    &channel,
                    &sum,
                    CallOptions::new().with_timeout(Duration::from_secs(5)),
                )
                .await?;
                for i in 1..=n {
                    requests.send(&i).await?;
                }
                requests.close().await?;
                response.await
            })
        })
        .collect();

    for (n, call) in (1..=16u32).zip(calls) {
        assert_eq!(call.await.unwrap().unwrap(), n * (n + 1) / 2);
    }
    assert_eq!(channel.in_flight(), 0);
    assert!(eventually(|| dispatcher.in_flight() == 0).await);
}
