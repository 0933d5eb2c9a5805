//! Message type tags for replicated log entries.
//!
//! An entry is one tag byte followed by the JSON body. A tag with
//! [`IGNORE_UNKNOWN_TYPE_FLAG`] set may be skipped by servers that do not know
//! it, so new message types can roll out ahead of the servers that apply them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StructsError;

/// Marks a message type as safe to ignore when unrecognized.
pub const IGNORE_UNKNOWN_TYPE_FLAG: u8 = 0x80;

macro_rules! message_types {
    ($($variant:ident = $code:literal => $name:literal),+ $(,)?) => {
        /// Kind of a replicated log entry. Codes are stable.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum MessageType {
            $($variant = $code,)+
        }

        impl MessageType {
            /// Every message type in code order.
            pub const ALL: &'static [MessageType] = &[$(MessageType::$variant),+];

            pub fn from_code(code: u8) -> Option<MessageType> {
                match code {
                    $($code => Some(MessageType::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $name,)+
                }
            }
        }
    };
}

message_types! {
    NodeRegister = 0 => "node_register",
    NodeDeregister = 1 => "node_deregister",
    NodeUpdateStatus = 2 => "node_update_status",
    NodeUpdateDrain = 3 => "node_update_drain",
    JobRegister = 4 => "job_register",
    JobDeregister = 5 => "job_deregister",
    EvalUpdate = 6 => "eval_update",
    EvalDelete = 7 => "eval_delete",
    AllocUpdate = 8 => "alloc_update",
    AllocClientUpdate = 9 => "alloc_client_update",
    ReconcileJobSummaries = 10 => "reconcile_job_summaries",
    VaultAccessorRegister = 11 => "vault_accessor_register",
    VaultAccessorDeregister = 12 => "vault_accessor_deregister",
    ApplyPlanResults = 13 => "apply_plan_results",
    DeploymentStatusUpdate = 14 => "deployment_status_update",
    DeploymentPromote = 15 => "deployment_promote",
    DeploymentAllocHealth = 16 => "deployment_alloc_health",
    DeploymentDelete = 17 => "deployment_delete",
    JobStability = 18 => "job_stability",
    AclPolicyUpsert = 19 => "acl_policy_upsert",
    AclPolicyDelete = 20 => "acl_policy_delete",
    AclTokenUpsert = 21 => "acl_token_upsert",
    AclTokenDelete = 22 => "acl_token_delete",
    AclTokenBootstrap = 23 => "acl_token_bootstrap",
    Autopilot = 24 => "autopilot",
    UpsertNodeEvents = 25 => "upsert_node_events",
    JobBatchDeregister = 26 => "job_batch_deregister",
    AllocUpdateDesiredTransition = 27 => "alloc_update_desired_transition",
    NodeUpdateEligibility = 28 => "node_update_eligibility",
    BatchNodeUpdateDrain = 29 => "batch_node_update_drain",
    SchedulerConfig = 30 => "scheduler_config",
    NodeBatchDeregister = 31 => "node_batch_deregister",
    ClusterMetadata = 32 => "cluster_metadata",
    ServiceIdentityAccessorRegister = 33 => "service_identity_accessor_register",
    ServiceIdentityAccessorDeregister = 34 => "service_identity_accessor_deregister",
    NodePoolUpsert = 35 => "node_pool_upsert",
    NodePoolDelete = 36 => "node_pool_delete",
}

impl MessageType {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = StructsError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        MessageType::from_code(code).ok_or(StructsError::UnknownMessageType(code))
    }
}

/// Tag of a decoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMessageType {
    Known(MessageType),
    /// Unrecognized, but flagged as safe to skip. Carries the tag without
    /// the flag bit.
    Ignorable(u8),
}

/// Encodes `payload` behind the tag of `msg_type`.
pub fn encode<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Vec<u8>, StructsError> {
    encode_tagged(msg_type.code(), payload)
}

/// Like [`encode`] with [`IGNORE_UNKNOWN_TYPE_FLAG`] set.
pub fn encode_ignorable<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, StructsError> {
    encode_tagged(msg_type.code() | IGNORE_UNKNOWN_TYPE_FLAG, payload)
}

fn encode_tagged<T: Serialize>(tag: u8, payload: &T) -> Result<Vec<u8>, StructsError> {
    let mut buf = vec![tag];
    serde_json::to_writer(&mut buf, payload)?;
    Ok(buf)
}

/// Splits an entry into its tag and body.
pub fn decode_header(bytes: &[u8]) -> Result<(RawMessageType, &[u8]), StructsError> {
    let (&tag, body) = bytes.split_first().ok_or(StructsError::EmptyMessage)?;
    let ignorable = tag & IGNORE_UNKNOWN_TYPE_FLAG != 0;
    let code = tag & !IGNORE_UNKNOWN_TYPE_FLAG;
    match MessageType::from_code(code) {
        Some(msg_type) => Ok((RawMessageType::Known(msg_type), body)),
        None if ignorable => Ok((RawMessageType::Ignorable(code), body)),
        None => Err(StructsError::UnknownMessageType(tag)),
    }
}

/// Decodes the body returned by [`decode_header`].
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, StructsError> {
    Ok(serde_json::from_slice(body)?)
}
