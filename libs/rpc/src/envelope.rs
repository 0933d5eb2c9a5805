//! Request and response envelopes shared by every RPC endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_structs::time::duration_nanos_serde;

/// Namespace used when a request names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Upper bound on how long a blocking query may wait.
pub const MAX_QUERY_TIME: Duration = Duration::from_secs(300);

/// Wait applied when a blocking query asks for none.
pub const DEFAULT_QUERY_TIME: Duration = Duration::from_secs(300);

/// A blocking query waits up to `1/JITTER_FRACTION` longer than requested so
/// that many watchers do not wake at once.
pub const JITTER_FRACTION: u32 = 16;

/// Routing and authorization facts every request exposes.
pub trait RpcInfo {
    fn request_region(&self) -> &str;

    /// Returns true for requests that do not modify state.
    fn is_read(&self) -> bool;

    /// Returns true if a follower may answer from its own state.
    fn allow_stale_read(&self) -> bool;

    fn request_namespace(&self) -> &str;

    fn auth_token(&self) -> &str;

    /// How long the request may block waiting for new data.
    fn time_to_block(&self) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Reads
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub namespace: String,
    /// Block until the store index passes this value. Zero does not block.
    #[serde(default)]
    pub min_query_index: u64,
    #[serde(default, with = "duration_nanos_serde")]
    pub max_query_time: Duration,
    #[serde(default)]
    pub allow_stale: bool,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub filter: String,
    /// Page size; zero returns everything.
    #[serde(default)]
    pub per_page: u32,
    /// Decimal index the page starts from.
    #[serde(default)]
    pub next_token: String,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub auth_token: String,
}

impl QueryOptions {
    /// Effective wait: zero for non-blocking reads, otherwise the requested
    /// time capped at [`MAX_QUERY_TIME`] and defaulted to
    /// [`DEFAULT_QUERY_TIME`].
    pub fn time_to_block(&self) -> Duration {
        if self.min_query_index == 0 {
            return Duration::ZERO;
        }
        if self.max_query_time > MAX_QUERY_TIME {
            MAX_QUERY_TIME
        } else if self.max_query_time.is_zero() {
            DEFAULT_QUERY_TIME
        } else {
            self.max_query_time
        }
    }
}

impl RpcInfo for QueryOptions {
    fn request_region(&self) -> &str {
        &self.region
    }

    fn is_read(&self) -> bool {
        true
    }

    fn allow_stale_read(&self) -> bool {
        self.allow_stale
    }

    fn request_namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    fn auth_token(&self) -> &str {
        &self.auth_token
    }

    fn time_to_block(&self) -> Duration {
        QueryOptions::time_to_block(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Index the response body was built from.
    pub index: u64,
    /// Time since the answering server last heard from the leader.
    #[serde(default, with = "duration_nanos_serde")]
    pub last_contact: Duration,
    #[serde(default)]
    pub known_leader: bool,
    /// Cursor of the next page; empty on the last page.
    #[serde(default)]
    pub next_token: String,
}

// =============================================================================
// Writes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub auth_token: String,
    /// Lets a client retry a write without applying it twice.
    #[serde(default)]
    pub idempotency_token: String,
}

impl RpcInfo for WriteRequest {
    fn request_region(&self) -> &str {
        &self.region
    }

    fn is_read(&self) -> bool {
        false
    }

    fn allow_stale_read(&self) -> bool {
        false
    }

    fn request_namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    fn auth_token(&self) -> &str {
        &self.auth_token
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMeta {
    /// Index at which the write was applied.
    pub index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, Duration::from_secs(10), Duration::ZERO)]
    #[case(5, Duration::ZERO, DEFAULT_QUERY_TIME)]
    #[case(5, Duration::from_secs(10), Duration::from_secs(10))]
    #[case(5, Duration::from_secs(3600), MAX_QUERY_TIME)]
    fn test_time_to_block(
        #[case] min_query_index: u64,
        #[case] max_query_time: Duration,
        #[case] expected: Duration,
    ) {
        let opts = QueryOptions {
            min_query_index,
            max_query_time,
            ..QueryOptions::default()
        };
        assert_eq!(opts.time_to_block(), expected);
        assert_eq!(RpcInfo::time_to_block(&opts), expected);
    }

    #[test]
    fn test_rpc_info() {
        let read = QueryOptions {
            region: "global".into(),
            allow_stale: true,
            ..QueryOptions::default()
        };
        assert!(read.is_read());
        assert!(read.allow_stale_read());
        assert_eq!(read.request_region(), "global");
        assert_eq!(read.request_namespace(), DEFAULT_NAMESPACE);

        let write = WriteRequest {
            region: "eu".into(),
            namespace: "prod".into(),
            ..WriteRequest::default()
        };
        assert!(!write.is_read());
        assert!(!write.allow_stale_read());
        assert_eq!(write.request_namespace(), "prod");
        assert_eq!(RpcInfo::time_to_block(&write), Duration::ZERO);
    }
}
