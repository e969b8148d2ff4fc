//! Session supervision, shared outbound rate limiting and inbound relaying for the
//! Chatline gateway. The server crate wires these pieces to Redis, the protocol
//! bridge and the HTTP/WebSocket surfaces.

pub mod credentials;
pub mod error;
pub mod events;
pub mod inbound;
pub mod limiter;
pub mod protocol;
mod session;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use error::SendError;
pub use events::{GatewayEvent, SessionStatus};
pub use supervisor::{ReconnectPolicy, SessionHandle, SessionSupervisor, SupervisorConfig};
