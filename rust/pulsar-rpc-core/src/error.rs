use std::fmt;
use std::time::Duration;

use pulsar_rpc_codec::{DecodeError, EncodeError};
use pulsar_rpc_wire::{CorrelationId, Status};

/// Broker publish/subscribe failure.
///
/// Broker clients retry according to their own policy; once this error
/// reaches a call it is final and surfaces as `UNAVAILABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The producer, consumer or subscription has been closed.
    Closed,
    /// The broker did not acknowledge a publish in time.
    Timeout(Duration),
    /// The broker refused the operation.
    Rejected(String),
    /// Connection-level failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Timeout(d) => write!(f, "publish not acknowledged within {:?}", d),
            TransportError::Rejected(msg) => write!(f, "broker rejected operation: {}", msg),
            TransportError::Io(msg) => write!(f, "transport I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Correlation registry failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is already registered for a live call.
    DuplicateId(CorrelationId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "correlation id {} already registered", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Error returned by call and channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Broker failure; the call is terminated with `UNAVAILABLE`.
    Transport(TransportError),
    /// The call API was misused.
    ProtocolViolation(&'static str),
    /// The request could not be encoded.
    Encode(EncodeError),
    /// A payload did not match the method's codec.
    Decode(DecodeError),
    /// Correlation id collision. Never happens with generated ids.
    DuplicateId(CorrelationId),
    /// The channel was used outside its contract.
    UnsupportedOperation(&'static str),
    /// The call already reached a terminal status.
    Closed(Status),
}

impl CallError {
    /// Terminal status this error maps to.
    pub fn to_status(&self) -> Status {
        match self {
            CallError::Transport(e) => Status::unavailable(e.to_string()),
            CallError::ProtocolViolation(msg) => {
                Status::internal(format!("protocol violation: {}", msg))
            }
            CallError::Encode(e) => Status::internal(e.to_string()),
            CallError::Decode(e) => Status::internal(e.to_string()),
            CallError::DuplicateId(id) => {
                Status::internal(format!("duplicate correlation id {}", id))
            }
            CallError::UnsupportedOperation(msg) => Status::unimplemented(*msg),
            CallError::Closed(status) => status.clone(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Transport(e) => write!(f, "transport error: {}", e),
            CallError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CallError::Encode(e) => write!(f, "{}", e),
            CallError::Decode(e) => write!(f, "{}", e),
            CallError::DuplicateId(id) => write!(f, "duplicate correlation id {}", id),
            CallError::UnsupportedOperation(msg) => write!(f, "unsupported operation: {}", msg),
            CallError::Closed(status) => write!(f, "call already closed ({})", status),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Transport(e) => Some(e),
            CallError::Encode(e) => Some(e),
            CallError::Decode(e) => Some(e),
            CallError::Closed(s) => Some(s),
            _ => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        CallError::Transport(e)
    }
}

impl From<RegistryError> for CallError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateId(id) => CallError::DuplicateId(id),
        }
    }
}

/// Errors building a service table or starting a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Service name is empty.
    EmptyServiceName,
    /// Method name is empty.
    EmptyMethodName,
    /// Service name exceeds [`MAX_SERVICE_NAME_LEN`](crate::MAX_SERVICE_NAME_LEN).
    ServiceNameTooLong,
    /// Method name exceeds [`MAX_METHOD_NAME_LEN`](crate::MAX_METHOD_NAME_LEN).
    MethodNameTooLong,
    /// Names may not contain `/`, which separates service and method.
    InvalidName(String),
    /// The same (service, method) pair was registered twice.
    DuplicateMethod(String),
    /// `serve` was called with an empty table.
    NoServices,
    /// `serve_service` named a service the table does not have.
    UnknownService(String),
    /// Subscribing to a request topic failed.
    Transport(TransportError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::EmptyServiceName => write!(f, "service name cannot be empty"),
            DispatchError::EmptyMethodName => write!(f, "method name cannot be empty"),
            DispatchError::ServiceNameTooLong => {
                write!(f, "service name exceeds {} bytes", crate::MAX_SERVICE_NAME_LEN)
            }
            DispatchError::MethodNameTooLong => {
                write!(f, "method name exceeds {} bytes", crate::MAX_METHOD_NAME_LEN)
            }
            DispatchError::InvalidName(name) => write!(f, "invalid name {:?}", name),
            DispatchError::DuplicateMethod(name) => write!(f, "method {} already registered", name),
            DispatchError::NoServices => write!(f, "no services registered"),
            DispatchError::UnknownService(name) => write!(f, "service {} is not registered", name),
            DispatchError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        DispatchError::Transport(e)
    }
}
