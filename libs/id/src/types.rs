//! Typed ID definitions for all scheduler objects.
//!
//! Server-generated objects carry UUID-backed IDs. Jobs are the exception:
//! their IDs are chosen by the submitter.

use serde::{Deserialize, Serialize};

use crate::{define_id, IdError};

// =============================================================================
// Well-known Names
// =============================================================================

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Wildcard namespace accepted by list endpoints.
pub const ALL_NAMESPACES: &str = "*";

/// Region used when a request does not name one.
pub const GLOBAL_REGION: &str = "global";

// =============================================================================
// Scheduling Objects
// =============================================================================

define_id!(AllocId, "allocation");
define_id!(EvalId, "evaluation");
define_id!(DeploymentId, "deployment");

// =============================================================================
// Cluster Membership
// =============================================================================

define_id!(NodeId, "node");

// =============================================================================
// Identity
// =============================================================================

define_id!(SigningKeyId, "signing key");

// =============================================================================
// Job ID
// =============================================================================

/// Job ID is chosen by the submitter, not generated.
///
/// It may be any non-empty string without spaces or null characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID without validating it.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Checks the submitter-facing job ID rules.
    pub fn validate(&self) -> Result<(), IdError> {
        if self.0.is_empty() {
            return Err(IdError::InvalidJobId("Missing job ID"));
        }
        if self.0.contains(' ') {
            return Err(IdError::InvalidJobId("Job ID contains a space"));
        }
        if self.0.contains('\0') {
            return Err(IdError::InvalidJobId("Job ID contains a null character"));
        }
        Ok(())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the unset ID.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the parent job ID of a dispatched or periodic child job.
    ///
    /// Child jobs are named `<parent>/dispatch-...` or `<parent>/periodic-...`.
    #[must_use]
    pub fn parent(&self) -> Option<JobId> {
        self.0
            .split_once('/')
            .map(|(parent, _)| JobId(parent.to_string()))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<&str> for JobId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Composite Keys
// =============================================================================

/// Primary key for namespaced objects (jobs, allocations).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespacedId {
    pub namespace: String,
    pub id: String,
}

impl NamespacedId {
    /// Creates a namespaced key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<ns: {:?}, id: {:?}>", self.namespace, self.id)
    }
}

/// Binds to an exact job revision without carrying the whole job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTuple {
    pub namespace: String,
    pub id: JobId,
    pub version: u64,
}

impl JobTuple {
    /// Creates a job tuple.
    #[must_use]
    pub fn new(namespace: impl Into<String>, id: impl Into<JobId>, version: u64) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version,
        }
    }

    /// Returns the namespaced key of the job, dropping the version.
    #[must_use]
    pub fn namespaced_id(&self) -> NamespacedId {
        NamespacedId::new(self.namespace.clone(), self.id.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_id_roundtrip() {
        let id = AllocId::generate();
        let parsed: AllocId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.is_uuid());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(EvalId::generate(), EvalId::generate());
    }

    #[test]
    fn test_parse_empty() {
        let result: Result<NodeId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_parse_not_uuid() {
        let err = NodeId::parse("node-id-2").unwrap_err();
        assert!(err.is_uuid_error());
        assert!(err.to_string().contains("invalid node ID"));
    }

    #[test]
    fn test_parse_uppercase_not_canonical() {
        let err = AllocId::parse("2F6A1C3E-8A4B-4C1D-9E2F-0B7D5A6C8E91").unwrap_err();
        assert!(matches!(err, IdError::NotCanonical { .. }));
    }

    #[test]
    fn test_opaque_ids_accepted_from_storage() {
        let id: NodeId = serde_json::from_str("\"node-id-2\"").unwrap();
        assert_eq!(id, "node-id-2");
        assert!(!id.is_uuid());
    }

    #[test]
    fn test_id_json_roundtrip() {
        let id = DeploymentId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: DeploymentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_short_id() {
        let id = AllocId::from("2f6a1c3e-8a4b-4c1d-9e2f-0b7d5a6c8e91");
        assert_eq!(id.short(), "2f6a1c3e");
        assert_eq!(AllocId::from("abc").short(), "abc");
    }

    #[test]
    fn test_default_is_unset() {
        assert!(AllocId::default().is_empty());
        assert!(JobId::default().is_empty());
    }

    #[test]
    fn test_job_id_rules() {
        assert!(JobId::new("example").validate().is_ok());
        assert_eq!(
            JobId::new("").validate().unwrap_err().to_string(),
            "Missing job ID"
        );
        assert_eq!(
            JobId::new("my job").validate().unwrap_err().to_string(),
            "Job ID contains a space"
        );
        assert_eq!(
            JobId::new("job\0").validate().unwrap_err().to_string(),
            "Job ID contains a null character"
        );
    }

    #[test]
    fn test_job_id_parent() {
        assert_eq!(
            JobId::new("batch/dispatch-1234").parent(),
            Some(JobId::new("batch"))
        );
        assert_eq!(JobId::new("batch").parent(), None);
    }

    #[test]
    fn test_namespaced_id_display() {
        let id = NamespacedId::new("default", "example");
        assert_eq!(id.to_string(), r#"<ns: "default", id: "example">"#);
    }

    #[test]
    fn test_job_tuple_key() {
        let tuple = JobTuple::new("prod", "web", 3);
        assert_eq!(tuple.namespaced_id(), NamespacedId::new("prod", "web"));
    }

    #[test]
    fn test_all_kinds_unique() {
        let kinds = vec![
            AllocId::KIND,
            EvalId::KIND,
            DeploymentId::KIND,
            NodeId::KIND,
            SigningKeyId::KIND,
        ];

        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(kinds.len(), unique.len(), "Duplicate ID kinds found!");
    }
}
