use std::fmt;
use std::sync::Arc;

use pulsar_rpc_codec::Marshaller;

/// Upper bound on a service name in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 256;

/// Upper bound on a method name in bytes.
pub const MAX_METHOD_NAME_LEN: usize = 128;

/// RPC method kind (streaming semantics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Single request, single response.
    Unary,
    /// Request stream, single response.
    ClientStreaming,
    /// Single request, response stream.
    ServerStreaming,
    /// Independent streams both ways.
    Bidirectional,
}

impl MethodKind {
    /// Whether the client may send more than one request message.
    pub fn client_streaming(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::Bidirectional)
    }

    /// Whether the server may send more than one response message.
    pub fn server_streaming(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::Bidirectional)
    }
}

/// Everything the core needs to know about one method.
///
/// Normally produced by a stub generator; one immutable instance per method,
/// shared by every call of it.
pub struct MethodDescriptor<Req, Resp> {
    service: String,
    method: String,
    kind: MethodKind,
    request: Arc<dyn Marshaller<Req>>,
    response: Arc<dyn Marshaller<Resp>>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        kind: MethodKind,
        request: impl Marshaller<Req>,
        response: impl Marshaller<Resp>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
            request: Arc::new(request),
            response: Arc::new(response),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// `Service/Method`, as carried in the `rpc-method` header.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    pub fn request_marshaller(&self) -> &Arc<dyn Marshaller<Req>> {
        &self.request
    }

    pub fn response_marshaller(&self) -> &Arc<dyn Marshaller<Resp>> {
        &self.response
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            method: self.method.clone(),
            kind: self.kind,
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<Req: 'static, Resp: 'static> fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("request", &self.request.encoding())
            .field("response", &self.response.encoding())
            .finish()
    }
}

/// Split `Service/Method` at the last `/`.
pub(crate) fn split_full_name(full: &str) -> Option<(&str, &str)> {
    let (service, method) = full.rsplit_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsar_rpc_codec::{RawMarshaller, postcard};

    #[test]
    fn kind_streaming_flags() {
        assert!(!MethodKind::Unary.client_streaming());
        assert!(!MethodKind::Unary.server_streaming());
        assert!(MethodKind::ClientStreaming.client_streaming());
        assert!(MethodKind::ServerStreaming.server_streaming());
        assert!(MethodKind::Bidirectional.client_streaming());
        assert!(MethodKind::Bidirectional.server_streaming());
    }

    #[test]
    fn full_name_round_trips_through_split() {
        let desc = MethodDescriptor::<String, bytes::Bytes>::new(
            "helloworld.Greeter",
            "SayHello",
            MethodKind::Unary,
            postcard::<String>(),
            RawMarshaller,
        );
        assert_eq!(desc.full_name(), "helloworld.Greeter/SayHello");
        assert_eq!(
            split_full_name(&desc.full_name()),
            Some(("helloworld.Greeter", "SayHello"))
        );
        assert_eq!(split_full_name("NoSlash"), None);
        assert_eq!(split_full_name("Svc/"), None);
    }
}
