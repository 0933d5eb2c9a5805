//! Tasks and the blocks that hang off them.
//!
//! ## Design Principles
//!
//! - Driver configuration is opaque to the core and travels as JSON
//! - Validation collects every violation; nested blocks are reported under a
//!   prefix naming their position (`Template 2 validation failed: ...`)

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::error::ValidationErrors;
use crate::job::JobType;
use crate::resources::Resources;
use crate::service::Service;
use crate::string_enum;
use crate::task_group::EphemeralDisk;
use crate::time::duration_nanos_serde;
use crate::workload_identity::{WorkloadIdentity, DEFAULT_IDENTITY_NAME};

/// Kill timeout applied when a task does not set one.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Logs
// =============================================================================

/// Log rotation settings of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogConfig {
    pub max_files: u64,
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub disabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_size_mb: 10,
            disabled: false,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.max_files < 1 {
            errs.push(format!("minimum number of files is 1; got {}", self.max_files));
        }
        if self.max_file_size_mb < 1 {
            errs.push(format!(
                "minimum file size is 1MB; got {}",
                self.max_file_size_mb
            ));
        }
        errs.into_result()
    }

    /// Disk the logs may occupy, in MB.
    pub fn usage_mb(&self) -> u64 {
        self.max_files.saturating_mul(self.max_file_size_mb)
    }
}

// =============================================================================
// Templates
// =============================================================================

string_enum! {
    /// Reaction of a task to a re-rendered template.
    pub enum TemplateChangeMode {
        Noop => "noop",
        Restart => "restart",
        Signal => "signal",
        Script => "script",
    }
}

impl Default for TemplateChangeMode {
    fn default() -> Self {
        Self::Restart
    }
}

/// Script run when a template changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeScript {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(with = "duration_nanos_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub fail_on_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub dest_path: String,
    #[serde(default)]
    pub embedded_tmpl: String,
    #[serde(default)]
    pub change_mode: TemplateChangeMode,
    #[serde(default)]
    pub change_signal: String,
    #[serde(default)]
    pub change_script: Option<ChangeScript>,
    /// Random wait before reacting to a change.
    #[serde(default, with = "duration_nanos_serde")]
    pub splay: Duration,
    /// Octal file mode.
    #[serde(default)]
    pub perms: String,
    /// Render into the task environment instead of a file.
    #[serde(default)]
    pub envvars: bool,
}

impl Template {
    pub fn canonicalize(&mut self) {
        self.change_signal = self.change_signal.to_uppercase();
        if self.perms.is_empty() {
            self.perms = "0644".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.source_path.is_empty() && self.embedded_tmpl.is_empty() {
            errs.push("Must specify a source path or have an embedded template");
        }
        if self.dest_path.is_empty() {
            errs.push("Must specify a destination for the template");
        } else if path_escapes_alloc_dir("task", &self.dest_path) {
            errs.push("destination escapes allocation directory");
        }

        match &self.change_mode {
            TemplateChangeMode::Noop | TemplateChangeMode::Restart => {}
            TemplateChangeMode::Signal => {
                if self.change_signal.is_empty() {
                    errs.push("Must specify signal value when change mode is signal");
                }
                if self.envvars {
                    errs.push("cannot use signals with env var templates");
                }
            }
            TemplateChangeMode::Script => {
                if self.change_script.is_none() {
                    errs.push(
                        "must specify change script configuration value when change mode is script",
                    );
                }
            }
            TemplateChangeMode::Unknown(_) => errs.push(
                "Invalid change mode. Must be one of the following: noop, signal, script, restart",
            ),
        }

        if !self.perms.is_empty() {
            match u32::from_str_radix(&self.perms, 8) {
                Ok(mode) if mode <= 0o7777 => {}
                Ok(_) => errs.push(format!("Failed to parse {:?} as octal: value out of range", self.perms)),
                Err(err) => errs.push(format!("Failed to parse {:?} as octal: {err}", self.perms)),
            }
        }
        errs.into_result()
    }
}

// =============================================================================
// Artifacts
// =============================================================================

string_enum! {
    /// How a downloaded artifact is materialized.
    pub enum GetterMode {
        Any => "any",
        File => "file",
        Dir => "dir",
    }
}

impl Default for GetterMode {
    fn default() -> Self {
        Self::Any
    }
}

/// A file fetched into the task directory before the task starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub getter_source: String,
    #[serde(default)]
    pub getter_options: BTreeMap<String, String>,
    #[serde(default)]
    pub getter_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub getter_mode: GetterMode,
    #[serde(default)]
    pub relative_dest: String,
}

impl TaskArtifact {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.getter_source.is_empty() {
            errs.push("source must be specified");
        }
        if !self.getter_mode.is_known() && !self.getter_mode.is_unset() {
            errs.push(format!(
                "invalid artifact mode {:?}; must be one of: any, file, dir",
                self.getter_mode.as_str()
            ));
        }
        if path_escapes_alloc_dir("task", &self.relative_dest) {
            errs.push("destination escapes allocation directory");
        }
        if let Err(err) = self.validate_checksum() {
            errs.push(err);
        }
        errs.into_result()
    }

    fn validate_checksum(&self) -> Result<(), String> {
        let Some(check) = self.getter_options.get("checksum") else {
            return Ok(());
        };
        // Interpolated values are resolved on the client.
        if check.contains("${") {
            return Ok(());
        }
        let check = check.trim();
        if check.is_empty() {
            return Err("checksum value cannot be empty".to_string());
        }
        let Some((kind, value)) = check.split_once(':') else {
            return Err(format!("checksum must be given as \"type:value\"; got {check:?}"));
        };
        if value.contains(':') {
            return Err(format!("checksum must be given as \"type:value\"; got {check:?}"));
        }
        let bytes = hex::decode(value).map_err(|err| format!("invalid checksum: {err}"))?;
        let expected = match kind {
            "md5" => 16,
            "sha1" => 20,
            "sha256" => 32,
            "sha512" => 64,
            other => return Err(format!("unsupported checksum type: {other}")),
        };
        if bytes.len() != expected {
            return Err(format!("invalid {kind} checksum: {value}"));
        }
        Ok(())
    }
}

// =============================================================================
// Vault
// =============================================================================

string_enum! {
    /// Reaction of a task to a renewed Vault token.
    pub enum VaultChangeMode {
        Noop => "noop",
        Restart => "restart",
        Signal => "signal",
    }
}

impl Default for VaultChangeMode {
    fn default() -> Self {
        Self::Restart
    }
}

/// Vault token request of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vault {
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    /// Expose the token as `VAULT_TOKEN`.
    #[serde(default)]
    pub env: bool,
    #[serde(default)]
    pub change_mode: VaultChangeMode,
    #[serde(default)]
    pub change_signal: String,
}

impl Vault {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.policies.is_empty() {
            errs.push("Policy list cannot be empty");
        }
        if self.policies.iter().any(|p| p == "root") {
            errs.push("Can not specify \"root\" policy");
        }
        match &self.change_mode {
            VaultChangeMode::Signal => {
                if self.change_signal.is_empty() {
                    errs.push("Signal must be specified when using change mode \"signal\"");
                }
            }
            VaultChangeMode::Noop | VaultChangeMode::Restart => {}
            VaultChangeMode::Unknown(mode) => {
                errs.push(format!("Unknown change mode {mode:?}"));
            }
        }
        errs.into_result()
    }
}

// =============================================================================
// Volumes and Lifecycle
// =============================================================================

/// Mount of a group volume into a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
    /// `private`, `host-to-task` or `bidirectional`; empty means private.
    #[serde(default)]
    pub propagation_mode: String,
}

impl VolumeMount {
    pub fn propagation_mode_is_valid(&self) -> bool {
        matches!(
            self.propagation_mode.as_str(),
            "" | "private" | "host-to-task" | "bidirectional"
        )
    }
}

string_enum! {
    /// Point in the allocation lifecycle a task runs at.
    pub enum LifecycleHook {
        Prestart => "prestart",
        Poststart => "poststart",
        Poststop => "poststop",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskLifecycle {
    pub hook: LifecycleHook,
    /// Keep running alongside the main tasks.
    #[serde(default)]
    pub sidecar: bool,
}

impl TaskLifecycle {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        if self.hook.is_unset() {
            return Err(ValidationErrors::single("no lifecycle hook provided"));
        }
        if !self.hook.is_known() {
            return Err(ValidationErrors::single(format!(
                "invalid hook: {}",
                self.hook
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Task
// =============================================================================

/// A single process of a task group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub user: String,
    /// Driver specific configuration.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub resources: Option<Resources>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, with = "duration_nanos_serde")]
    pub kill_timeout: Duration,
    #[serde(default)]
    pub kill_signal: String,
    #[serde(default, with = "duration_nanos_serde")]
    pub shutdown_delay: Duration,
    pub log_config: Option<LogConfig>,
    #[serde(default)]
    pub artifacts: Vec<TaskArtifact>,
    #[serde(default)]
    pub vault: Option<Vault>,
    #[serde(default)]
    pub templates: Vec<Template>,
    /// The allocation stops when the leader exits.
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub lifecycle: Option<TaskLifecycle>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// The default identity.
    #[serde(default)]
    pub identity: Option<WorkloadIdentity>,
    /// Additional named identities.
    #[serde(default)]
    pub identities: Vec<WorkloadIdentity>,
}

impl Task {
    /// Fills defaults before validation.
    pub fn canonicalize(&mut self) {
        if self.resources.is_none() {
            self.resources = Some(Resources::default_resources());
        }
        if self.log_config.is_none() {
            self.log_config = Some(LogConfig::default());
        }
        if self.kill_timeout.is_zero() {
            self.kill_timeout = DEFAULT_KILL_TIMEOUT;
        }
        let identity = self.identity.get_or_insert_with(WorkloadIdentity::default);
        identity.canonicalize();
        for wi in &mut self.identities {
            wi.canonicalize();
        }
        for tmpl in &mut self.templates {
            tmpl.canonicalize();
        }
        for svc in &mut self.services {
            if svc.task_name.is_empty() {
                svc.task_name = self.name.clone();
            }
            if let Some(wi) = &mut svc.identity {
                wi.canonicalize();
            }
        }
    }

    pub fn validate(
        &self,
        ephemeral_disk: Option<&EphemeralDisk>,
        job_type: &JobType,
    ) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.name.is_empty() {
            errs.push("Missing task name");
        }
        if self.name.contains(['/', '\\']) {
            errs.push("Task name cannot include slashes");
        }
        if self.driver.is_empty() {
            errs.push("Missing task driver");
        }

        match &self.resources {
            None => errs.push("Missing task resources"),
            Some(res) => errs.merge(res.validate()),
        }
        match &self.log_config {
            None => errs.push("Missing Log Config"),
            Some(logs) => errs.merge(logs.validate()),
        }

        for (idx, constr) in self.constraints.iter().enumerate() {
            errs.nest(
                format!("Constraint {} validation failed", idx + 1),
                constr.validate(),
            );
            if constr.operand().is_some_and(|op| op.is_group_only()) {
                errs.push(format!(
                    "Constraint {} has disallowed Operand at task level: {}",
                    idx + 1,
                    constr.operand
                ));
            }
        }

        errs.merge(self.validate_services());

        if let (Some(logs), Some(disk)) = (&self.log_config, ephemeral_disk) {
            let usage = logs.usage_mb();
            if disk.size_mb <= usage {
                errs.push(format!(
                    "log storage ({usage} MB) must be less than requested disk capacity ({} MB)",
                    disk.size_mb
                ));
            }
        }

        for (idx, artifact) in self.artifacts.iter().enumerate() {
            errs.nest(
                format!("Artifact {} validation failed", idx + 1),
                artifact.validate(),
            );
        }

        if let Some(vault) = &self.vault {
            errs.nest("Vault validation failed", vault.validate());
        }

        let mut destinations: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, tmpl) in self.templates.iter().enumerate() {
            errs.nest(
                format!("Template {} validation failed", idx + 1),
                tmpl.validate(),
            );
            if let Some(other) = destinations.get(tmpl.dest_path.as_str()) {
                errs.push(format!(
                    "Template {} has same destination as {}",
                    idx + 1,
                    other
                ));
            } else {
                destinations.insert(tmpl.dest_path.as_str(), idx + 1);
            }
        }

        if let Some(lifecycle) = &self.lifecycle {
            errs.nest("Lifecycle validation failed", lifecycle.validate());
            if *job_type == JobType::System && lifecycle.hook == LifecycleHook::Poststop {
                errs.push("System jobs may not use poststop lifecycle hooks");
            }
        }

        for (idx, vm) in self.volume_mounts.iter().enumerate() {
            if !vm.propagation_mode_is_valid() {
                errs.push(format!(
                    "Volume Mount ({idx}) has an invalid propagation mode: {:?}",
                    vm.propagation_mode
                ));
            }
        }

        errs.merge(self.validate_identities());
        errs.into_result()
    }

    fn validate_services(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let mut known = BTreeSet::new();
        for (idx, svc) in self.services.iter().enumerate() {
            errs.nest(
                format!("service[{idx}] {:?} validation failed", svc.name),
                svc.validate(),
            );
            if !known.insert((svc.name.as_str(), svc.port_label.as_str())) {
                errs.push(format!("service {:?} is duplicate", svc.name));
            }
        }
        errs.into_result()
    }

    fn validate_identities(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(wi) = &self.identity {
            errs.nest(
                format!("Identity {:?} failed validation", wi.name),
                wi.validate(),
            );
        }
        let mut seen = BTreeSet::new();
        for wi in &self.identities {
            if wi.name == DEFAULT_IDENTITY_NAME {
                errs.push(format!(
                    "Alternate identities cannot be named {DEFAULT_IDENTITY_NAME:?}"
                ));
            }
            if !seen.insert(wi.name.as_str()) {
                errs.push(format!("Duplicate identity name {:?}", wi.name));
            }
            errs.nest(
                format!("Identity {:?} failed validation", wi.name),
                wi.validate(),
            );
        }
        errs.into_result()
    }

    /// Looks up a declared identity by name, including the default one.
    pub fn lookup_identity(&self, name: &str) -> Option<&WorkloadIdentity> {
        self.identity
            .iter()
            .chain(self.identities.iter())
            .find(|wi| wi.name == name)
    }

    /// Validation warnings for the task's identities.
    pub fn warnings(&self) -> Vec<String> {
        self.identities
            .iter()
            .flat_map(|wi| {
                wi.warnings()
                    .into_iter()
                    .map(move |w| format!("Identity {:?}: {w}", wi.name))
            })
            .collect()
    }

    /// Returns true if any of the task's services joins the mesh.
    pub fn uses_connect(&self) -> bool {
        self.services.iter().any(Service::uses_connect)
    }
}

/// Reports whether `path`, joined under `prefix` inside the allocation
/// directory, would leave the allocation directory.
pub fn path_escapes_alloc_dir(prefix: &str, path: &str) -> bool {
    let mut depth: i64 = 0;
    for component in Path::new(prefix).join(path.trim_start_matches('/')).components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}
