//! Wire-visible RPC errors.
//!
//! The rendered text of every variant is part of the protocol: clients match
//! on the canonical prefixes, so a message may gain a suffix but never change
//! its prefix.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use fleet_structs::ValidationErrors;

/// Prefix of errors that carry an explicit status code.
pub const RPC_CODED_ERROR_PREFIX: &str = "RPC Error:: ";

const ERR_NO_LEADER: &str = "No cluster leader";
const ERR_NO_REGION_PATH: &str = "No path to region";
const ERR_TOKEN_NOT_FOUND: &str = "ACL token not found";
const ERR_TOKEN_EXPIRED: &str = "ACL token expired";
const ERR_TOKEN_INVALID: &str = "ACL token invalid";
const ERR_PERMISSION_DENIED: &str = "Permission denied";
const ERR_UNKNOWN_ALLOCATION: &str = "Unknown allocation";
const ERR_UNKNOWN_NODE: &str = "Unknown node";
const ERR_UNKNOWN_JOB: &str = "Unknown job";
const ERR_UNKNOWN_EVALUATION: &str = "Unknown evaluation";
const ERR_UNKNOWN_DEPLOYMENT: &str = "Unknown deployment";
const ERR_CSI_MAX_CLAIMS: &str = "volume max claims reached";
const ERR_CSI_UNSCHEDULABLE: &str = "volume is currently unschedulable";

/// Coarse classification that decides how a caller reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Leadership,
    Permission,
    Transport,
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("No cluster leader")]
    NoLeader,

    #[error("No path to region")]
    NoRegionPath,

    #[error("ACL token not found")]
    TokenNotFound,

    #[error("ACL token expired")]
    TokenExpired,

    #[error("ACL token invalid")]
    TokenInvalid,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Unknown allocation \"{0}\"")]
    UnknownAllocation(String),

    #[error("Unknown node \"{0}\"")]
    UnknownNode(String),

    #[error("Unknown job \"{0}\"")]
    UnknownJob(String),

    #[error("Unknown evaluation \"{0}\"")]
    UnknownEvaluation(String),

    #[error("Unknown deployment \"{0}\"")]
    UnknownDeployment(String),

    #[error("volume max claims reached")]
    CsiVolumeMaxClaims,

    #[error("volume is currently unschedulable")]
    CsiVolumeUnschedulable,

    /// User input broke one or more rules.
    #[error("{0}")]
    Validation(ValidationErrors),

    /// A pagination cursor that is not a decimal index.
    #[error("invalid next token {0:?}")]
    InvalidNextToken(String),

    /// A check-and-set write lost against a concurrent writer.
    #[error("index conflict: expected {expected}, current {current}")]
    IndexConflict { expected: u64, current: u64 },

    /// A plan was submitted with a token that no longer owns its evaluation.
    #[error("evaluation token does not match")]
    EvalTokenMismatch,

    /// Error with an explicit status code, see [`RpcError::coded`].
    #[error("RPC Error:: {code},{message}")]
    Coded { code: u16, message: String },

    #[error("{0}")]
    Recoverable(RecoverableError),

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Builds an error that renders as `RPC Error:: <code>,<message>`.
    pub fn coded(code: u16, message: impl Into<String>) -> Self {
        RpcError::Coded {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        RpcError::Internal(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::NoLeader | RpcError::NoRegionPath => ErrorKind::Leadership,
            RpcError::TokenNotFound
            | RpcError::TokenExpired
            | RpcError::TokenInvalid
            | RpcError::PermissionDenied => ErrorKind::Permission,
            RpcError::UnknownAllocation(_)
            | RpcError::UnknownNode(_)
            | RpcError::UnknownJob(_)
            | RpcError::UnknownEvaluation(_)
            | RpcError::UnknownDeployment(_) => ErrorKind::NotFound,
            RpcError::Validation(_)
            | RpcError::InvalidNextToken(_)
            | RpcError::CsiVolumeMaxClaims
            | RpcError::CsiVolumeUnschedulable => ErrorKind::Validation,
            RpcError::IndexConflict { .. } | RpcError::EvalTokenMismatch => ErrorKind::Conflict,
            RpcError::Coded { .. } => ErrorKind::Transport,
            RpcError::Recoverable(err) if err.recoverable => ErrorKind::Recoverable,
            RpcError::Recoverable(_) | RpcError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the transport may retry the request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Leadership | ErrorKind::Recoverable)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::Permission
    }

    /// Status code a caller surfaces over HTTP.
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::Coded { code, .. } => *code,
            _ => match self.kind() {
                ErrorKind::Validation => 400,
                ErrorKind::Permission => 403,
                ErrorKind::NotFound => 404,
                ErrorKind::Conflict => 409,
                _ => 500,
            },
        }
    }

    /// Recovers a typed error from its rendered text, e.g. after it crossed a
    /// process boundary as a string.
    pub fn from_message(message: &str) -> RpcError {
        if let Some((code, message)) = decode_coded_error(message) {
            return RpcError::Coded { code, message };
        }
        let fixed = [
            (ERR_NO_LEADER, RpcError::NoLeader),
            (ERR_NO_REGION_PATH, RpcError::NoRegionPath),
            (ERR_TOKEN_NOT_FOUND, RpcError::TokenNotFound),
            (ERR_TOKEN_EXPIRED, RpcError::TokenExpired),
            (ERR_TOKEN_INVALID, RpcError::TokenInvalid),
            (ERR_PERMISSION_DENIED, RpcError::PermissionDenied),
            (ERR_CSI_MAX_CLAIMS, RpcError::CsiVolumeMaxClaims),
            (ERR_CSI_UNSCHEDULABLE, RpcError::CsiVolumeUnschedulable),
        ];
        if let Some((_, err)) = fixed.into_iter().find(|(prefix, _)| message.contains(*prefix)) {
            return err;
        }
        let unknown: [(&str, fn(String) -> RpcError); 5] = [
            (ERR_UNKNOWN_ALLOCATION, RpcError::UnknownAllocation),
            (ERR_UNKNOWN_NODE, RpcError::UnknownNode),
            (ERR_UNKNOWN_JOB, RpcError::UnknownJob),
            (ERR_UNKNOWN_EVALUATION, RpcError::UnknownEvaluation),
            (ERR_UNKNOWN_DEPLOYMENT, RpcError::UnknownDeployment),
        ];
        for (prefix, build) in unknown {
            if let Some(rest) = message.strip_prefix(prefix) {
                let id = rest.trim().trim_matches('"');
                return build(id.to_string());
            }
        }
        RpcError::Internal(message.to_string())
    }
}

impl From<ValidationErrors> for RpcError {
    fn from(errs: ValidationErrors) -> Self {
        RpcError::Validation(errs)
    }
}

impl From<RecoverableError> for RpcError {
    fn from(err: RecoverableError) -> Self {
        RpcError::Recoverable(err)
    }
}

/// Extracts `(code, message)` from any error text carrying the coded prefix.
pub fn decode_coded_error(err: &str) -> Option<(u16, String)> {
    let start = err.find(RPC_CODED_ERROR_PREFIX)?;
    let rest = &err[start + RPC_CODED_ERROR_PREFIX.len()..];
    let (code, message) = rest.split_once(',')?;
    let code = code.trim().parse().ok()?;
    Some((code, message.to_string()))
}

// =============================================================================
// Recoverable errors
// =============================================================================

/// An opaque error tagged by its producer as safe to retry or not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RecoverableError {
    pub message: String,
    pub recoverable: bool,
}

impl RecoverableError {
    pub fn new(err: impl fmt::Display, recoverable: bool) -> Self {
        Self {
            message: err.to_string(),
            recoverable,
        }
    }
}

/// Returns true if `err` or any error in its source chain is a
/// [`RecoverableError`] marked recoverable.
pub fn is_recoverable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(rec) = err.downcast_ref::<RecoverableError>() {
            return rec.recoverable;
        }
        if let Some(RpcError::Recoverable(rec)) = err.downcast_ref::<RpcError>() {
            return rec.recoverable;
        }
        current = err.source();
    }
    false
}

/// Marks an error returned by a server rather than raised locally by the
/// client that forwarded the request.
#[derive(Debug, Error)]
#[error("{inner}")]
pub struct WrappedServerError {
    #[source]
    inner: Box<dyn StdError + Send + Sync>,
}

impl WrappedServerError {
    pub fn new(inner: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            inner: inner.into(),
        }
    }

    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }
}

/// Returns true if `err` is, or wraps, an error that came from a server.
pub fn is_server_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<WrappedServerError>() {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RpcError::NoLeader, "No cluster leader", ErrorKind::Leadership)]
    #[case(RpcError::TokenExpired, "ACL token expired", ErrorKind::Permission)]
    #[case(
        RpcError::UnknownAllocation("a1".into()),
        "Unknown allocation \"a1\"",
        ErrorKind::NotFound
    )]
    #[case(
        RpcError::UnknownDeployment("d1".into()),
        "Unknown deployment \"d1\"",
        ErrorKind::NotFound
    )]
    #[case(
        RpcError::CsiVolumeMaxClaims,
        "volume max claims reached",
        ErrorKind::Validation
    )]
    #[case(
        RpcError::coded(404, "alloc not found"),
        "RPC Error:: 404,alloc not found",
        ErrorKind::Transport
    )]
    fn test_rendering_and_kind(
        #[case] err: RpcError,
        #[case] text: &str,
        #[case] kind: ErrorKind,
    ) {
        assert_eq!(err.to_string(), text);
        assert_eq!(err.kind(), kind);
        assert_eq!(RpcError::from_message(text), err);
    }

    #[test]
    fn test_decode_coded_error() {
        assert_eq!(
            decode_coded_error("RPC Error:: 400,ACL auth method auth0 not found"),
            Some((400, "ACL auth method auth0 not found".to_string()))
        );
        // The message keeps any further commas.
        assert_eq!(
            decode_coded_error("rpc failed: RPC Error:: 500,a,b"),
            Some((500, "a,b".to_string()))
        );
        assert_eq!(decode_coded_error("RPC Error:: abc,msg"), None);
        assert_eq!(decode_coded_error("RPC Error:: 404"), None);
        assert_eq!(decode_coded_error("No cluster leader"), None);
    }

    #[test]
    fn test_retryable() {
        assert!(RpcError::NoLeader.is_retryable());
        assert!(RpcError::from(RecoverableError::new("boom", true)).is_retryable());
        assert!(!RpcError::from(RecoverableError::new("boom", false)).is_retryable());
        assert!(!RpcError::PermissionDenied.is_retryable());
        assert!(!RpcError::UnknownJob("j".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RpcError::coded(429, "slow down").status_code(), 429);
        assert_eq!(RpcError::UnknownNode("n".into()).status_code(), 404);
        assert_eq!(RpcError::PermissionDenied.status_code(), 403);
        assert_eq!(
            RpcError::from(ValidationErrors::single("Missing job name")).status_code(),
            400
        );
        assert_eq!(RpcError::EvalTokenMismatch.status_code(), 409);
    }

    #[test]
    fn test_is_recoverable_through_wrapping() {
        let wrapped = WrappedServerError::new(RecoverableError::new("node busy", true));
        assert!(is_server_error(&wrapped));
        assert!(is_recoverable(&wrapped));

        let fatal = WrappedServerError::new(RecoverableError::new("bad input", false));
        assert!(!is_recoverable(&fatal));

        let plain = RpcError::NoLeader;
        assert!(!is_server_error(&plain));
        assert!(!is_recoverable(&plain));
    }

    #[test]
    fn test_validation_keeps_every_message() {
        let mut errs = ValidationErrors::new();
        errs.push("Missing job region");
        errs.push("Missing job name");
        let err = RpcError::from(errs);
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("Missing job region"));
        assert!(text.contains("Missing job name"));
    }
}
