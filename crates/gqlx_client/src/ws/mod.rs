//! Reconnecting `graphql-ws` subscription client.
//!
//! - `protocol`: the `{id, type, payload}` envelope
//! - `dial`: connection providers (tokio-tungstenite, or any custom [`Dialer`])
//! - `client`: [`WsTransport`] and its connection state machine

mod client;
pub mod dial;
pub mod protocol;

pub use client::{ConnectionState, WsConfig, WsTransport};
pub use dial::{tungstenite_dialer, Dialer, WsConnection};
pub use protocol::{MessageType, OperationMessage};
