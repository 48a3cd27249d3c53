#![deny(unsafe_code)]

//! RPC over topic-based publish/subscribe.
//!
//! A [`Channel`] originates [`Call`]s. Each call publishes its envelopes to
//! the service's request topic, tagged with a fresh correlation id and the
//! channel's reply topic for that service. A [`Dispatcher`] consumes the
//! request topic, runs the handler registered in its [`ServiceTable`] and
//! publishes responses to the reply topic, where the channel's reply loop
//! routes them back to the waiting call through the
//! [`CorrelationRegistry`].
//!
//! The broker itself is abstract: anything implementing [`TopicProducer`]
//! and [`TopicConsumer`] can carry the traffic.

mod call;
mod channel;
mod client;
mod config;
mod descriptor;
mod dispatch;
mod error;
mod metrics;
mod registry;
mod reorder;
#[cfg(test)]
mod test_support;
mod transport;

pub use call::{Call, CallListener, CallOptions, CallState};
pub use channel::Channel;
pub use client::{
    RequestSink, ResponseFuture, ResponseStream, bidi_streaming, client_streaming,
    server_streaming, unary,
};
pub use config::{
    ChannelConfig, DEFAULT_PUBLISH_TIMEOUT, DEFAULT_REORDER_WINDOW, DispatcherConfig, TopicNames,
};
pub use descriptor::{MAX_METHOD_NAME_LEN, MAX_SERVICE_NAME_LEN, MethodDescriptor, MethodKind};
pub use dispatch::{
    Dispatcher, Handler, RequestContext, RequestStream, ResponseSink, ServeHandle, ServiceTable,
};
pub use error::{CallError, DispatchError, RegistryError, TransportError};
pub use metrics::{RpcMetrics, RpcMetricsSnapshot};
pub use registry::CorrelationRegistry;
pub use transport::{
    InboundMessage, KIND_HEADER, MessageId, OutboundMessage, Subscription, TopicConsumer,
    TopicProducer,
};

pub use pulsar_rpc_codec as codec;
pub use pulsar_rpc_wire as wire;
