pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod wire;

pub use server::{start, ServerConfig, ServerHandle};
