#![deny(unsafe_code)]

//! RPC over topic-based publish/subscribe brokers.
//!
//! Clients open a [`Channel`] over a broker's producer and consumer and make
//! calls described by [`MethodDescriptor`]s; servers register [`Handler`]s in
//! a [`ServiceTable`] and run them with a [`Dispatcher`]. Envelopes travel on
//! `{namespace}/{service}.requests` and
//! `{namespace}/{service}.replies.{client_id}` topics and are matched to
//! calls by correlation id.
//!
//! ```ignore
//! use pulsar_rpc::prelude::*;
//!
//! let broker = MemBroker::new();
//! let say_hello = MethodDescriptor::new(
//!     "Greeter",
//!     "SayHello",
//!     MethodKind::Unary,
//!     codec::json::<String>(),
//!     codec::json::<String>(),
//! );
//!
//! let table = ServiceTable::new().with(
//!     &say_hello,
//!     Handler::unary(|_ctx, name: String| async move { Ok(format!("hello {name}")) }),
//! )?;
//! let dispatcher = Dispatcher::new(broker.clone(), table, DispatcherConfig::default());
//! let serving = dispatcher.serve(&broker).await?;
//!
//! let channel = Channel::new(broker.clone(), broker.clone(), ChannelConfig::default());
//! let reply = unary(&channel, &say_hello, &"world".to_string(), CallOptions::new()).await?;
//! assert_eq!(reply, "hello world");
//! ```

pub use pulsar_rpc_core::{
    // Client
    Call,
    CallListener,
    CallOptions,
    CallState,
    Channel,
    ChannelConfig,
    RequestSink,
    ResponseFuture,
    ResponseStream,
    bidi_streaming,
    client_streaming,
    server_streaming,
    unary,
    // Server
    Dispatcher,
    DispatcherConfig,
    Handler,
    RequestContext,
    RequestStream,
    ResponseSink,
    ServeHandle,
    ServiceTable,
    // Shared
    CorrelationRegistry,
    DEFAULT_PUBLISH_TIMEOUT,
    DEFAULT_REORDER_WINDOW,
    MAX_METHOD_NAME_LEN,
    MAX_SERVICE_NAME_LEN,
    MethodDescriptor,
    MethodKind,
    RpcMetrics,
    RpcMetricsSnapshot,
    TopicNames,
    // Errors
    CallError,
    DispatchError,
    RegistryError,
    TransportError,
};

pub use pulsar_rpc_codec as codec;
pub use pulsar_rpc_wire as wire;
pub use pulsar_rpc_wire::{Code, CorrelationId, Metadata, Status};

/// Broker capabilities and implementations.
///
/// The in-memory broker is behind the `mem` feature (on by default).
pub mod transport {
    pub use pulsar_rpc_core::{
        InboundMessage, KIND_HEADER, MessageId, OutboundMessage, Subscription, TopicConsumer,
        TopicProducer,
    };

    #[cfg(feature = "mem")]
    pub use pulsar_rpc_transport_mem::{
        BrokerStats, FaultAction, FaultConfig, FaultInjector, MemBroker, MemSubscription,
    };
}

#[cfg(feature = "mem")]
pub use transport::MemBroker;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use pulsar_rpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::codec;
    pub use crate::{
        CallListener, CallOptions, Channel, ChannelConfig, Code, Dispatcher, DispatcherConfig,
        Handler, Metadata, MethodDescriptor, MethodKind, RequestContext, RequestStream,
        ResponseSink, ServiceTable, Status, bidi_streaming, client_streaming, server_streaming,
        unary,
    };

    #[cfg(feature = "mem")]
    pub use crate::transport::{FaultConfig, MemBroker};
}
