//! Server side of gqlx.
//!
//! - `executor`: the seam to a GraphQL engine
//! - `streams`: heartbeat-verified subscription streams over a broker
//! - `server`: request loop answering queries, mutations and subscribe requests

pub mod executor;
pub mod server;
pub mod streams;

pub use executor::{Executor, ResultStream};
pub use server::{BrokerServer, ServerConfig};
pub use streams::{Streams, StreamsConfig};
