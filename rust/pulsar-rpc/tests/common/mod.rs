//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::time::Duration;

use pulsar_rpc::prelude::*;
use pulsar_rpc::ServeHandle;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `Echo/<method>` with JSON strings both ways.
pub fn echo(method: &str, kind: MethodKind) -> MethodDescriptor<String, String> {
    MethodDescriptor::new(
        "Echo",
        method,
        kind,
        codec::json::<String>(),
        codec::json::<String>(),
    )
}

/// `Counter/<method>` with postcard integers both ways.
pub fn counter(method: &str, kind: MethodKind) -> MethodDescriptor<u32, u32> {
    MethodDescriptor::new(
        "Counter",
        method,
        kind,
        codec::postcard::<u32>(),
        codec::postcard::<u32>(),
    )
}

pub async fn serve(broker: &MemBroker, table: ServiceTable) -> (Dispatcher, ServeHandle) {
    let dispatcher = Dispatcher::new(broker.clone(), table, DispatcherConfig::default());
    let handle = dispatcher.serve(broker).await.expect("serve");
    (dispatcher, handle)
}

pub fn channel(broker: &MemBroker) -> Channel {
    Channel::new(broker.clone(), broker.clone(), ChannelConfig::default())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen<T> {
    Headers(Metadata),
    Message(T),
    Close(Status, Metadata),
}

/// Listener forwarding callbacks to the test.
pub struct Recorder<T> {
    tx: mpsc::UnboundedSender<Seen<T>>,
}

impl<T> Recorder<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Seen<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<T: Send + 'static> CallListener<T> for Recorder<T> {
    fn on_headers(&mut self, headers: Metadata) {
        let _ = self.tx.send(Seen::Headers(headers));
    }

    fn on_message(&mut self, message: T) {
        let _ = self.tx.send(Seen::Message(message));
    }

    fn on_close(&mut self, status: Status, trailers: Metadata) {
        let _ = self.tx.send(Seen::Close(status, trailers));
    }
}

/// Collect callbacks up to and including `on_close`, then make sure nothing
/// follows it.
pub async fn until_closed<T>(rx: &mut mpsc::UnboundedReceiver<Seen<T>>) -> Vec<Seen<T>> {
    let mut seen = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for on_close")
            .expect("listener dropped before on_close");
        let closed = matches!(next, Seen::Close(..));
        seen.push(next);
        if closed {
            break;
        }
    }
    let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(
        !matches!(extra, Ok(Some(_))),
        "callback delivered after on_close"
    );
    seen
}

pub fn close_status<T>(seen: &[Seen<T>]) -> &Status {
    match seen.last() {
        Some(Seen::Close(status, _)) => status,
        _ => panic!("last callback is not on_close"),
    }
}

pub fn messages<T: Clone>(seen: &[Seen<T>]) -> Vec<T> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Message(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

/// Poll `cond` until it holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
