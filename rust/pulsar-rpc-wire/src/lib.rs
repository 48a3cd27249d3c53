#![deny(unsafe_code)]

//! Wire types for pulsar-rpc.
//!
//! Every protocol event of a call (headers, one message, half-close, terminal
//! status) travels through the broker as one [`Envelope`]. Envelopes carry the
//! call's [`CorrelationId`] and a per-direction sequence number so the
//! receiving side can demultiplex and reorder them.

mod envelope;
mod id;
mod metadata;
mod status;

pub use envelope::*;
pub use id::*;
pub use metadata::*;
pub use status::*;
