//! Workload identity declarations and signing results.
//!
//! A task or service declares the identities it wants; the servers sign a
//! JWT for each of them (see [`crate::identity`]) and hand them to the client.
//! Signing failures are reported per identity next to the successes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_id::{is_valid_name, AllocId};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::time::duration_nanos_serde;

/// Name of the identity every task receives.
pub const DEFAULT_IDENTITY_NAME: &str = "default";

/// Audience of the default identity.
pub const DEFAULT_IDENTITY_AUDIENCE: &str = "nomadproject.io";

string_enum! {
    /// What the client does when a renewed identity is written.
    pub enum IdentityChangeMode {
        Restart => "restart",
        Signal => "signal",
    }
}

impl Default for IdentityChangeMode {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

/// An identity requested by a task or service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub name: String,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub change_mode: IdentityChangeMode,
    #[serde(default)]
    pub change_signal: String,
    /// Expose the token as an environment variable.
    #[serde(default)]
    pub env: bool,
    /// Write the token into the secrets directory.
    #[serde(default)]
    pub file: bool,
    /// Custom path for the token file; requires `file`.
    #[serde(default)]
    pub filepath: String,
    /// Set for identities attached to a service.
    #[serde(default)]
    pub service_name: String,
    /// Zero means the token never expires.
    #[serde(default, with = "duration_nanos_serde")]
    pub ttl: Duration,
}

impl WorkloadIdentity {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_IDENTITY_NAME
    }

    /// Fills defaults before validation.
    pub fn canonicalize(&mut self) {
        if self.name.is_empty() {
            self.name = DEFAULT_IDENTITY_NAME.to_string();
        }
        if self.is_default() && self.audience.is_empty() {
            self.audience = vec![DEFAULT_IDENTITY_AUDIENCE.to_string()];
        }
        self.change_signal = self.change_signal.to_uppercase();
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !is_valid_name(&self.name) {
            errs.push(format!("invalid name {:?}", self.name));
        }
        for (idx, aud) in self.audience.iter().enumerate() {
            if aud.is_empty() {
                errs.push(format!("an empty string is an invalid audience ({})", idx + 1));
            }
        }
        match &self.change_mode {
            IdentityChangeMode::Signal => {
                if self.change_signal.is_empty() {
                    errs.push("change_signal must be specified when using change_mode=signal");
                }
            }
            mode => {
                if !mode.is_known() && !mode.is_unset() {
                    errs.push(format!("invalid change_mode: {:?}", mode.as_str()));
                }
                if !self.change_signal.is_empty() {
                    errs.push(format!(
                        "can only use change_signal={:?} with change_mode=signal",
                        self.change_signal
                    ));
                }
            }
        }
        if !self.filepath.is_empty() && !self.file {
            errs.push("file parameter must be true in order to specify filepath");
        }
        errs.into_result()
    }

    /// Insecure but legal settings worth telling the submitter about.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.audience.len() {
            0 => warnings.push("identities without an audience are insecure".to_string()),
            1 => {}
            _ => warnings.push(
                "while multiple audiences is allowed, it is more secure to use 1 audience per identity"
                    .to_string(),
            ),
        }
        if !self.is_default() && self.ttl.is_zero() {
            warnings.push("identities without an expiration are insecure".to_string());
        }
        if self.env && self.change_mode != IdentityChangeMode::Restart {
            warnings.push(
                "using env=true without change_mode=\"restart\" may result in task not getting updated identity"
                    .to_string(),
            );
        }
        warnings
    }
}

// =============================================================================
// Handles and Signing Results
// =============================================================================

/// Kind of workload an identity is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    #[default]
    Task,
    Service,
}

/// Names one identity of one workload inside an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WIHandle {
    /// Task name or service name.
    pub workload_identifier: String,
    pub workload_type: WorkloadType,
    pub identity_name: String,
}

impl WIHandle {
    pub fn task(task: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            workload_identifier: task.into(),
            workload_type: WorkloadType::Task,
            identity_name: identity.into(),
        }
    }

    pub fn service(service: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            workload_identifier: service.into(),
            workload_type: WorkloadType::Service,
            identity_name: identity.into(),
        }
    }
}

/// A request to sign one identity of one allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentityRequest {
    pub alloc_id: AllocId,
    pub handle: WIHandle,
}

/// A signed identity handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWorkloadIdentity {
    pub alloc_id: AllocId,
    pub handle: WIHandle,
    pub jwt: String,
    /// `None` for tokens that never expire.
    pub expiration: Option<DateTime<Utc>>,
}

/// Why an identity could not be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    AllocNotFound,
    TaskNotFound,
    IdentityNotFound,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AllocNotFound => "allocation not found",
            Self::TaskNotFound => "task not found",
            Self::IdentityNotFound => "identity not found",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentityRejection {
    pub alloc_id: AllocId,
    pub handle: WIHandle,
    pub reason: RejectionReason,
}

/// Reply to a batch signing request: successes and rejections side by side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocIdentitiesResponse {
    #[serde(default)]
    pub signed: Vec<SignedWorkloadIdentity>,
    #[serde(default)]
    pub rejections: Vec<WorkloadIdentityRejection>,
}

impl AllocIdentitiesResponse {
    pub fn reject(&mut self, request: &WorkloadIdentityRequest, reason: RejectionReason) {
        self.rejections.push(WorkloadIdentityRejection {
            alloc_id: request.alloc_id.clone(),
            handle: request.handle.clone(),
            reason,
        });
    }

    pub fn is_fully_signed(&self) -> bool {
        self.rejections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> WorkloadIdentity {
        WorkloadIdentity {
            name: name.to_string(),
            audience: vec!["http://nomadproject.io/".to_string()],
            ttl: Duration::from_secs(3600),
            ..WorkloadIdentity::default()
        }
    }

    #[test]
    fn test_canonicalize_empty() {
        let mut wi = WorkloadIdentity::default();
        wi.canonicalize();
        assert_eq!(wi.name, "default");
        assert_eq!(wi.audience, vec!["nomadproject.io".to_string()]);
        assert!(wi.validate().is_ok());
        assert!(wi.warnings().is_empty());
    }

    #[test]
    fn test_canonicalize_uppercases_signal() {
        let mut wi = identity("foo-id");
        wi.change_mode = IdentityChangeMode::Signal;
        wi.change_signal = "sighup".to_string();
        wi.file = true;
        wi.canonicalize();
        assert_eq!(wi.change_signal, "SIGHUP");
        assert!(wi.validate().is_ok());
    }

    #[test]
    fn test_signal_mode_requires_signal() {
        let mut wi = identity("foo-id");
        wi.change_mode = IdentityChangeMode::Signal;
        assert!(wi.validate().unwrap_err().contains("change_signal must be specified"));
    }

    #[test]
    fn test_signal_without_signal_mode() {
        let mut wi = identity("foo-id");
        wi.change_mode = IdentityChangeMode::Restart;
        wi.change_signal = "SIGHUP".to_string();
        assert!(wi.validate().unwrap_err().contains("can only use change_signal="));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["../etc/passwd", r"A:\hacks", &"x".repeat(1025)] {
            let mut wi = identity(name);
            wi.canonicalize();
            assert!(wi.validate().unwrap_err().contains("invalid name"), "{name}");
        }
    }

    #[test]
    fn test_empty_audience_position() {
        let mut wi = identity("foo");
        wi.audience = vec!["ok".into(), String::new()];
        assert!(wi
            .validate()
            .unwrap_err()
            .contains("an empty string is an invalid audience (2)"));
    }

    #[test]
    fn test_filepath_requires_file() {
        let mut wi = identity("foo");
        wi.filepath = "foo".into();
        assert!(wi
            .validate()
            .unwrap_err()
            .contains("file parameter must be true in order to specify filepath"));
    }

    #[test]
    fn test_warnings() {
        let mut wi = identity("foo");
        wi.audience.clear();
        wi.ttl = Duration::ZERO;
        let warnings = wi.warnings();
        assert!(warnings.iter().any(|w| w.contains("without an audience")));
        assert!(warnings.iter().any(|w| w.contains("without an expiration")));

        let mut wi = identity("foo");
        wi.audience.push("bar".into());
        wi.env = true;
        let warnings = wi.warnings();
        assert!(warnings.iter().any(|w| w.contains("multiple audiences")));
        assert!(warnings.iter().any(|w| w.contains("using env=true")));
    }

    #[test]
    fn test_rejections_reported_alongside_signed() {
        let mut resp = AllocIdentitiesResponse::default();
        let req = WorkloadIdentityRequest {
            alloc_id: AllocId::from("a1"),
            handle: WIHandle::task("web", "vault"),
        };
        resp.reject(&req, RejectionReason::IdentityNotFound);
        assert!(!resp.is_fully_signed());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["rejections"][0]["reason"], "identity_not_found");
    }
}
