//! # fleet-rpc
//!
//! The request/response layer shared by every endpoint.
//!
//! ## Overview
//!
//! - [`envelope`]: `QueryOptions`/`QueryMeta` for reads, `WriteRequest`/`WriteMeta`
//!   for writes, and the [`RpcInfo`] trait routing uses
//! - [`error`]: the wire-visible error taxonomy, coded errors and recoverable
//!   errors
//! - [`paginator`]: numeric cursor pagination over modify-index ordered lists
//! - [`blocking`]: blocking queries over a store index watch
//!
//! ## Design Principles
//!
//! - Error text is protocol: canonical prefixes never change
//! - A blocking query never returns a body built across two indexes
//! - Cursors compare as numbers, not strings

pub mod blocking;
pub mod envelope;
pub mod error;
pub mod paginator;

pub use blocking::{blocking_query, BlockingQueryConfig};
pub use envelope::{
    QueryMeta, QueryOptions, RpcInfo, WriteMeta, WriteRequest, DEFAULT_QUERY_TIME,
    JITTER_FRACTION, MAX_QUERY_TIME,
};
pub use error::{
    decode_coded_error, is_recoverable, is_server_error, ErrorKind, RecoverableError, RpcError,
    WrappedServerError, RPC_CODED_ERROR_PREFIX,
};
pub use paginator::{Paged, Paginator};
