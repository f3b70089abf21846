pub mod client;
pub mod remote;

pub use client::{ClientError, ConnectionState, Listener, Outcome, ZeroConfClient};
pub use remote::{Endpoint, HttpRegistrar};
