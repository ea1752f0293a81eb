//! Client side of gqlx.
//!
//! - `response`: the uniform [`Response`] handle (single, channel, proxy)
//! - `transport`: the [`Transport`] contract and its implementations:
//!   [`HttpTransport`], [`WsTransport`], [`BrokerTransport`], [`SplitTransport`]
//! - `extension`: request interceptors, with [`PersistedQuery`] built in
//! - `client`: the high-level [`Client`]

pub mod apq;
pub mod broker;
pub mod client;
pub mod extension;
pub mod http;
pub mod response;
pub mod split;
pub mod transport;
pub mod ws;

pub use apq::PersistedQuery;
pub use broker::{BrokerTransport, BrokerTransportConfig};
pub use client::{Client, Subscription};
pub use extension::{AroundRequest, AroundRequestFn, Extensions, Next};
pub use http::{HttpConfig, HttpTransport};
pub use response::{
    BoxResponse, ChanResponse, OnResult, ProxyResponse, ProxySink, Response, SingleResponse,
};
pub use split::SplitTransport;
pub use transport::Transport;
pub use ws::{ConnectionState, WsConfig, WsTransport};

pub use gqlx_core::{Error, ErrorCode, Operation, OperationKind, OperationResult, Result};
pub use tokio_util::sync::CancellationToken;
