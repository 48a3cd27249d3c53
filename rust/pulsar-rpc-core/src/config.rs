use std::time::Duration;

use pulsar_rpc_wire::CorrelationId;

/// Default bound on waiting for a publish acknowledgement.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of out-of-order envelopes buffered per call.
pub const DEFAULT_REORDER_WINDOW: usize = 64;

/// Derives topic names for a namespace.
///
/// Requests for a service go to `{namespace}/{service}.requests`; replies for
/// one client go to `{namespace}/{service}.replies.{client_id}`. Without a
/// namespace the prefix is omitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicNames {
    namespace: Option<String>,
}

impl TopicNames {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn request_topic(&self, service: &str) -> String {
        self.qualify(format!("{}.requests", service))
    }

    pub fn reply_topic(&self, service: &str, client_id: &str) -> String {
        self.qualify(format!("{}.replies.{}", service, client_id))
    }

    fn qualify(&self, local: String) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns.trim_end_matches('/'), local),
            None => local,
        }
    }
}

/// Configuration for a client [`Channel`](crate::Channel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Topic prefix identifying the target deployment. `None` leaves the
    /// channel unbound: topics are unqualified and `authority()` fails.
    pub namespace: Option<String>,
    /// Identifies this client's reply topics. Random by default.
    pub client_id: String,
    /// Bound on each publish acknowledgement.
    pub publish_timeout: Duration,
    /// Deadline applied to calls whose options carry none.
    pub default_deadline: Option<Duration>,
    /// Out-of-order envelopes buffered per call before the call fails.
    pub reorder_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            client_id: CorrelationId::generate().to_hex(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            default_deadline: None,
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

impl ChannelConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn topics(&self) -> TopicNames {
        TopicNames::new(self.namespace.clone())
    }
}

/// Configuration for a server [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Must match the namespace clients use.
    pub namespace: Option<String>,
    /// Shared subscription name; dispatcher instances using the same name
    /// split the request load.
    pub subscription: String,
    pub publish_timeout: Duration,
    pub reorder_window: usize,
    /// How long envelopes for an id may wait for its HEADERS.
    pub orphan_timeout: Duration,
    /// How many completed ids are remembered to drop late envelopes.
    pub tombstone_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            subscription: "rpc-dispatcher".to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            reorder_window: DEFAULT_REORDER_WINDOW,
            orphan_timeout: Duration::from_secs(30),
            tombstone_capacity: 4096,
        }
    }
}

impl DispatcherConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }

    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }

    pub fn topics(&self) -> TopicNames {
        TopicNames::new(self.namespace.clone())
    }
}
