//! # Identity Claims
//!
//! The claim set signed into node and workload JWTs. An [`IdentityClaims`]
//! carries the registered JWT claims plus exactly one [`ClaimsVariant`].
//!
//! ## Design Principles
//!
//! - The wire form is a single flat JSON object; `nomad_node_pool` sits at the
//!   top level for both node variants
//! - The core never signs: it builds claims and hands them to a
//!   [`ClaimSigner`]
//! - Expiry checks take `now` from the caller

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use fleet_id::SigningKeyId;

use crate::allocation::Allocation;
use crate::error::{StructsError, ValidationErrors};
use crate::job::Job;
use crate::node::Node;
use crate::string_enum;
use crate::time::{add_duration, duration_nanos_serde, format_duration};
use crate::workload_identity::{
    WIHandle, WorkloadIdentity, WorkloadType, DEFAULT_IDENTITY_AUDIENCE, DEFAULT_IDENTITY_NAME,
};

/// How long a node may keep failing to obtain an identity before the failure
/// is treated as permanent.
pub const IDENTITY_SIGNING_ERROR_TERMINAL_THRESHOLD: Duration = Duration::from_secs(10 * 60);

const NODE_SUBJECT_PREFIX: &str = "node";
const NODE_INTRODUCTION_SUBJECT_PREFIX: &str = "node-introduction";

// =============================================================================
// Claims
// =============================================================================

/// Claims identifying a registered node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIdentityClaims {
    pub node_id: String,
    pub node_datacenter: String,
    pub node_pool: String,
}

/// Claims a node presents before it has registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIntroductionIdentityClaims {
    /// Empty when the introduction is not bound to a node name.
    pub node_name: String,
    pub node_pool: String,
}

/// Claims identifying one workload of one allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadIdentityClaims {
    pub namespace: String,
    pub job_id: String,
    pub allocation_id: String,
    pub task: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimsVariant {
    Node(NodeIdentityClaims),
    NodeIntroduction(NodeIntroductionIdentityClaims),
    Workload(WorkloadIdentityClaims),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireClaims", into = "WireClaims")]
pub struct IdentityClaims {
    pub issuer: String,
    pub subject: String,
    pub audience: Vec<String>,
    /// `None` for claims that never expire.
    pub expiry: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    /// Unique token id (`jti`).
    pub id: String,
    pub variant: ClaimsVariant,
}

impl IdentityClaims {
    fn with_variant(variant: ClaimsVariant, now: DateTime<Utc>) -> Self {
        Self {
            issuer: String::new(),
            subject: String::new(),
            audience: Vec::new(),
            expiry: None,
            not_before: Some(now),
            issued_at: Some(now),
            id: Uuid::new_v4().to_string(),
            variant,
        }
    }

    /// Claims for a registered node.
    pub fn new_node(node: &Node, region: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let mut claims = Self::with_variant(
            ClaimsVariant::Node(NodeIdentityClaims {
                node_id: node.id.to_string(),
                node_datacenter: node.datacenter.clone(),
                node_pool: node.node_pool.clone(),
            }),
            now,
        );
        claims.subject = Self::node_subject(region, &node.node_pool, node.id.as_str());
        claims.audience = vec![DEFAULT_IDENTITY_AUDIENCE.to_string()];
        claims.set_expiry(now, ttl);
        claims
    }

    /// Claims a node uses to introduce itself to the servers.
    pub fn new_node_introduction(
        region: &str,
        pool: &str,
        name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut claims = Self::with_variant(
            ClaimsVariant::NodeIntroduction(NodeIntroductionIdentityClaims {
                node_name: name.to_string(),
                node_pool: pool.to_string(),
            }),
            now,
        );
        claims.subject = Self::node_introduction_subject(region, pool, name);
        claims.audience = vec![DEFAULT_IDENTITY_AUDIENCE.to_string()];
        claims.set_expiry(now, ttl);
        claims
    }

    /// Claims for one identity of one workload in `alloc`.
    pub fn new_workload(
        region: &str,
        job: &Job,
        alloc: &Allocation,
        handle: &WIHandle,
        identity: &WorkloadIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        let job_id = workload_job_id(job);
        let (task, service) = match handle.workload_type {
            WorkloadType::Task => (Some(handle.workload_identifier.clone()), None),
            WorkloadType::Service => (None, Some(handle.workload_identifier.clone())),
        };
        let mut claims = Self::with_variant(
            ClaimsVariant::Workload(WorkloadIdentityClaims {
                namespace: alloc.namespace.clone(),
                job_id: job_id.to_string(),
                allocation_id: alloc.id.to_string(),
                task,
                service,
            }),
            now,
        );
        claims.subject = Self::workload_subject(
            region,
            &alloc.namespace,
            job_id,
            &alloc.task_group,
            &handle.workload_identifier,
            &identity.name,
        );
        claims.audience = identity.audience.clone();
        claims.set_expiry(now, identity.ttl);
        claims
    }

    pub fn node_subject(region: &str, pool: &str, node_id: &str) -> String {
        [NODE_SUBJECT_PREFIX, region, pool, node_id, DEFAULT_IDENTITY_NAME].join(":")
    }

    /// The name segment is left out when `name` is empty.
    pub fn node_introduction_subject(region: &str, pool: &str, name: &str) -> String {
        let mut parts = vec![NODE_INTRODUCTION_SUBJECT_PREFIX, region, pool];
        if !name.is_empty() {
            parts.push(name);
        }
        parts.push(DEFAULT_IDENTITY_NAME);
        parts.join(":")
    }

    pub fn workload_subject(
        region: &str,
        namespace: &str,
        job_id: &str,
        group: &str,
        workload: &str,
        identity: &str,
    ) -> String {
        [region, namespace, job_id, group, workload, identity].join(":")
    }

    pub fn is_node(&self) -> bool {
        matches!(self.variant, ClaimsVariant::Node(_))
    }

    pub fn is_node_introduction(&self) -> bool {
        matches!(self.variant, ClaimsVariant::NodeIntroduction(_))
    }

    pub fn is_workload(&self) -> bool {
        matches!(self.variant, ClaimsVariant::Workload(_))
    }

    /// Pool named by either node variant.
    pub fn node_pool(&self) -> Option<&str> {
        match &self.variant {
            ClaimsVariant::Node(node) => Some(&node.node_pool),
            ClaimsVariant::NodeIntroduction(intro) => Some(&intro.node_pool),
            ClaimsVariant::Workload(_) => None,
        }
    }

    /// Sets the expiry to `now + ttl`; a zero TTL leaves the claims without
    /// an expiry.
    pub fn set_expiry(&mut self, now: DateTime<Utc>, ttl: Duration) {
        if !ttl.is_zero() {
            self.expiry = Some(add_duration(now, ttl));
        }
    }

    /// Returns true if less than a third of `ttl` remains before expiry.
    pub fn is_expiring(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_expiring_in_threshold(add_duration(now, ttl / 3))
    }

    /// Returns true if the claims expire before `threshold`.
    pub fn is_expiring_in_threshold(&self, threshold: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|exp| exp < threshold)
    }

    /// Reads the claims of a JWT without checking its signature.
    pub fn decode_unverified(jwt: &str) -> Result<IdentityClaims, StructsError> {
        let mut parts = jwt.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(StructsError::InvalidToken("expected three segments".into())),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|err| StructsError::InvalidToken(err.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Workload identities of dispatched and periodic children name their
/// parent.
fn workload_job_id(job: &Job) -> &str {
    if job.parent_id.is_empty() {
        job.id.as_str()
    } else {
        job.parent_id.as_str()
    }
}

// =============================================================================
// Wire Form
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireClaims {
    #[serde(rename = "iss", default, skip_serializing_if = "String::is_empty")]
    issuer: String,
    #[serde(rename = "sub", default, skip_serializing_if = "String::is_empty")]
    subject: String,
    #[serde(rename = "aud", default, skip_serializing_if = "Vec::is_empty")]
    audience: Vec<String>,
    #[serde(
        rename = "exp",
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    expiry: Option<DateTime<Utc>>,
    #[serde(
        rename = "nbf",
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    not_before: Option<DateTime<Utc>>,
    #[serde(
        rename = "iat",
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    issued_at: Option<DateTime<Utc>>,
    #[serde(rename = "jti", default, skip_serializing_if = "String::is_empty")]
    id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_node_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_node_datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_allocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nomad_service: Option<String>,
}

impl From<IdentityClaims> for WireClaims {
    fn from(claims: IdentityClaims) -> Self {
        let mut wire = WireClaims {
            issuer: claims.issuer,
            subject: claims.subject,
            audience: claims.audience,
            expiry: claims.expiry,
            not_before: claims.not_before,
            issued_at: claims.issued_at,
            id: claims.id,
            ..WireClaims::default()
        };
        match claims.variant {
            ClaimsVariant::Node(node) => {
                wire.nomad_node_id = Some(node.node_id);
                wire.nomad_node_datacenter = Some(node.node_datacenter);
                wire.nomad_node_pool = Some(node.node_pool);
            }
            ClaimsVariant::NodeIntroduction(intro) => {
                wire.nomad_node_name = Some(intro.node_name).filter(|n| !n.is_empty());
                wire.nomad_node_pool = Some(intro.node_pool);
            }
            ClaimsVariant::Workload(wl) => {
                wire.nomad_namespace = Some(wl.namespace);
                wire.nomad_job_id = Some(wl.job_id);
                wire.nomad_allocation_id = Some(wl.allocation_id);
                wire.nomad_task = wl.task;
                wire.nomad_service = wl.service;
            }
        }
        wire
    }
}

impl TryFrom<WireClaims> for IdentityClaims {
    type Error = StructsError;

    fn try_from(wire: WireClaims) -> Result<Self, Self::Error> {
        let variant = if let Some(node_id) = wire.nomad_node_id {
            ClaimsVariant::Node(NodeIdentityClaims {
                node_id,
                node_datacenter: wire.nomad_node_datacenter.unwrap_or_default(),
                node_pool: wire.nomad_node_pool.unwrap_or_default(),
            })
        } else if let Some(allocation_id) = wire.nomad_allocation_id {
            ClaimsVariant::Workload(WorkloadIdentityClaims {
                namespace: wire.nomad_namespace.unwrap_or_default(),
                job_id: wire.nomad_job_id.unwrap_or_default(),
                allocation_id,
                task: wire.nomad_task,
                service: wire.nomad_service,
            })
        } else if let Some(node_pool) = wire.nomad_node_pool {
            ClaimsVariant::NodeIntroduction(NodeIntroductionIdentityClaims {
                node_name: wire.nomad_node_name.unwrap_or_default(),
                node_pool,
            })
        } else {
            return Err(StructsError::InvalidToken(
                "claims carry neither node nor workload claims".into(),
            ));
        };
        Ok(IdentityClaims {
            issuer: wire.issuer,
            subject: wire.subject,
            audience: wire.audience,
            expiry: wire.expiry,
            not_before: wire.not_before,
            issued_at: wire.issued_at,
            id: wire.id,
            variant,
        })
    }
}

// =============================================================================
// Node Identity Lifecycle
// =============================================================================

/// Returns true if `node` needs a fresh identity: it has none, the one it has
/// is expiring, or it was signed with a key other than `active_key`.
pub fn should_generate_node_identity(
    node: &Node,
    active_key: &SigningKeyId,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    if node.identity_signing_key_id.is_empty() || node.identity_signing_key_id != *active_key {
        return true;
    }
    match node.identity_expiry() {
        Some(expiry) => expiry < add_duration(now, ttl / 3),
        None => false,
    }
}

/// Returns true once signing has been failing since `first_failure` for
/// longer than [`IDENTITY_SIGNING_ERROR_TERMINAL_THRESHOLD`].
pub fn identity_signing_error_is_terminal(
    first_failure: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    add_duration(first_failure, IDENTITY_SIGNING_ERROR_TERMINAL_THRESHOLD) <= now
}

string_enum! {
    /// How strictly the servers require node introduction tokens.
    pub enum NodeIntroductionEnforcement {
        None => "none",
        Warn => "warn",
        Strict => "strict",
    }
}

impl Default for NodeIntroductionEnforcement {
    fn default() -> Self {
        Self::Warn
    }
}

/// Server settings for node introduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIntroductionConfig {
    #[serde(default)]
    pub enforcement: NodeIntroductionEnforcement,
    #[serde(with = "duration_nanos_serde")]
    pub default_identity_ttl: Duration,
    #[serde(with = "duration_nanos_serde")]
    pub max_identity_ttl: Duration,
}

impl Default for NodeIntroductionConfig {
    fn default() -> Self {
        Self {
            enforcement: NodeIntroductionEnforcement::default(),
            default_identity_ttl: Duration::from_secs(5 * 60),
            max_identity_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl NodeIntroductionConfig {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.enforcement.is_known() {
            errs.push(format!(
                "invalid enforcement {:?}, must be one of {:?}",
                self.enforcement.as_str(),
                NodeIntroductionEnforcement::KNOWN
            ));
        }
        if self.default_identity_ttl.is_zero() {
            errs.push("default_identity_ttl must be positive");
        }
        if self.max_identity_ttl.is_zero() {
            errs.push("max_identity_ttl must be positive");
        }
        if self.default_identity_ttl > self.max_identity_ttl {
            errs.push(format!(
                "default_identity_ttl {} exceeds max_identity_ttl {}",
                format_duration(self.default_identity_ttl),
                format_duration(self.max_identity_ttl)
            ));
        }
        errs.into_result()
    }

    /// TTL to issue for a requested TTL: the default when unset, capped at
    /// the maximum.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.default_identity_ttl)
            .min(self.max_identity_ttl)
    }
}

// =============================================================================
// Signing
// =============================================================================

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no active signing key")]
    NoActiveKey,

    #[error("signing key {0} not found")]
    KeyNotFound(SigningKeyId),

    #[error("failed to sign claims: {0}")]
    Signing(String),
}

impl SignerError {
    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SignerError::NoActiveKey)
    }
}

/// Turns claims into a JWT. The returned key id is recorded on the
/// allocation or node so verifiers can pick the matching public key.
pub trait ClaimSigner: Send + Sync {
    fn sign(&self, claims: &IdentityClaims) -> Result<(String, SigningKeyId), SignerError>;
}
