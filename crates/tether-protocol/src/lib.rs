//! Protocol-side plumbing: translation of the messaging library's event
//! vocabulary into the orchestrator's closed [`ProtocolEvent`] set, the
//! reconnect backoff policy, and a scriptable in-process client.
//!
//! [`ProtocolEvent`]: tether_core::protocol::ProtocolEvent

pub mod adapter;
pub mod backoff;
pub mod mock;

pub use adapter::{translate, ExternalEvent};
pub use backoff::Backoff;
pub use mock::{MockClientFactory, MockProtocolClient, MockScript};
