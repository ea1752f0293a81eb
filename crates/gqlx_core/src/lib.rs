//! Core data model for gqlx.
//!
//! This crate provides the types shared by every gqlx transport:
//! - `operation`: Operations (query, mutation, subscription) and their wire payload
//! - `result`: Operation results and result-level errors
//! - `error`: Typed transport errors
//! - `codec`: Pluggable payload serialization

pub mod codec;
pub mod error;
pub mod operation;
pub mod result;

pub use codec::{Codec, JsonCodec};
pub use error::{Error, ErrorCode, Result, ResultExt};
pub use operation::{Extensions, Operation, OperationKind, OperationPayload, Variables};
pub use result::{GraphQLError, OperationResult};
