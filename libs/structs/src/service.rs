//! Service registrations declared by groups and tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::string_enum;
use crate::workload_identity::WorkloadIdentity;

string_enum! {
    /// Catalog a service is registered in.
    pub enum ServiceProvider {
        Consul => "consul",
        Nomad => "nomad",
    }
}

impl Default for ServiceProvider {
    fn default() -> Self {
        Self::Consul
    }
}

/// Service mesh settings of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceConnect {
    /// The workload speaks the mesh protocol itself.
    #[serde(default)]
    pub native: bool,
    /// A sidecar proxy is injected next to the workload.
    #[serde(default)]
    pub sidecar_service: bool,
    /// The service is a mesh gateway.
    #[serde(default)]
    pub gateway: bool,
}

impl ServiceConnect {
    pub fn is_empty(&self) -> bool {
        !self.native && !self.sidecar_service && !self.gateway
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// Group or task port label the service is reachable on.
    #[serde(default)]
    pub port_label: String,
    #[serde(default)]
    pub provider: ServiceProvider,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Task the service belongs to when declared at group level.
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub connect: Option<ServiceConnect>,
    #[serde(default)]
    pub identity: Option<WorkloadIdentity>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Service {
    /// Validates the parts of a service that do not depend on its context.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.name.is_empty() {
            errs.push("Service must have a name");
        } else if !is_valid_service_name(&self.name) {
            errs.push(format!(
                "Service name must be valid per RFC 1123 and can contain only alphanumeric characters or dashes: {:?}",
                self.name
            ));
        }
        if !self.provider.is_known() {
            errs.push(format!(
                "Service provider must be one of {}; got {:?}",
                ServiceProvider::KNOWN.join(", "),
                self.provider.as_str()
            ));
        }
        if self.provider == ServiceProvider::Nomad && self.uses_connect() {
            errs.push("Service with provider nomad cannot include Connect blocks");
        }
        for (idx, tag) in self.tags.iter().enumerate() {
            if tag.is_empty() {
                errs.push(format!("Service {} tag {} is empty", self.name, idx + 1));
            }
        }
        if let Some(identity) = &self.identity {
            errs.nest(
                format!("Service {} identity failed validation", self.name),
                identity.validate(),
            );
        }
        errs.into_result()
    }

    pub fn uses_connect(&self) -> bool {
        self.connect.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Name the service identity is issued under.
    pub fn identity_handle_name(&self) -> String {
        format!("{}-{}", self.name, self.port_label)
    }
}

/// RFC 1123 label with interpolation allowed: letters, digits, dashes and
/// `${...}` runs.
fn is_valid_service_name(name: &str) -> bool {
    if name.len() > 63 && !name.contains("${") {
        return false;
    }
    let mut depth = 0usize;
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                depth += 1;
            }
            '}' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            c if c.is_ascii_alphanumeric() || c == '-' => {}
            _ => return false,
        }
    }
    depth == 0 && !name.starts_with('-') && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            port_label: "http".to_string(),
            ..Service::default()
        }
    }

    #[test]
    fn test_service_names() {
        assert!(service("web-api").validate().is_ok());
        assert!(service("${JOB}-web").validate().is_ok());
        assert!(service("web_api").validate().is_err());
        assert!(service("-web").validate().is_err());
        assert!(service("").validate().unwrap_err().contains("Service must have a name"));
    }

    #[test]
    fn test_nomad_provider_rejects_connect() {
        let mut svc = service("web");
        svc.provider = ServiceProvider::Nomad;
        svc.connect = Some(ServiceConnect {
            sidecar_service: true,
            ..ServiceConnect::default()
        });
        assert!(svc.validate().unwrap_err().contains("cannot include Connect"));
    }

    #[test]
    fn test_unknown_provider() {
        let mut svc = service("web");
        svc.provider = ServiceProvider::parse("etcd");
        assert!(svc.validate().unwrap_err().contains("consul, nomad"));
    }

    #[test]
    fn test_empty_connect_is_not_connect() {
        let mut svc = service("web");
        svc.connect = Some(ServiceConnect::default());
        assert!(!svc.uses_connect());
    }
}
