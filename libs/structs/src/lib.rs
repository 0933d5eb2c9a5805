//! # fleet-structs
//!
//! Domain model and scheduling-decision kernel of the fleet scheduler.
//!
//! ## Overview
//!
//! Everything the RPC layer, state store, scheduler workers and plan applier
//! agree on lives here:
//!
//! - **Jobs**: [`Job`] → [`TaskGroup`] → [`Task`], with the policies they
//!   carry and their validation
//! - **Nodes**: [`Node`], [`NodePool`] and the resource model
//! - **Allocations**: placement of one task group on one node, with the
//!   reschedule and disconnect decisions that drive its replacement
//! - **Deployments**: per-group canary and health accounting
//! - **Plans**: the optimistic-commit exchange between workers and applier
//! - **Identity claims**: the claim set signed into node and workload tokens
//!
//! ## Design Principles
//!
//! - Validation collects every violation into [`ValidationErrors`]
//! - Objects read from the state store are immutable; changes go through
//!   `copy()` and a plan
//! - Decisions that depend on time take `now` as an argument
//! - Unknown enum values submitted by users are kept verbatim so validation
//!   can name them

pub mod allocation;
pub mod constraint;
pub mod deployment;
pub mod disconnect;
pub mod error;
pub mod hash;
pub mod identity;
pub mod job;
mod macros;
pub mod message;
pub mod multiregion;
pub mod node;
pub mod node_pool;
pub mod periodic;
pub mod plan;
pub mod reschedule;
pub mod resources;
pub mod restart;
pub mod service;
pub mod task;
pub mod task_group;
pub mod time;
pub mod topology;
pub mod update;
pub mod version;
pub mod workload_identity;

pub use allocation::{
    AllocDeploymentStatus, AllocListStub, AllocState, AllocStateField, Allocation, ClientStatus,
    DesiredStatus, DesiredTransition, TaskEvent, TaskState, TaskStateKind,
};
pub use constraint::{Constraint, ConstraintOperand};
pub use deployment::{Deployment, DeploymentState, DeploymentStatus, DeploymentStatusUpdate};
pub use disconnect::DisconnectStrategy;
pub use error::{StructsError, ValidationErrors};
pub use hash::ContentHash;
pub use identity::{ClaimSigner, ClaimsVariant, IdentityClaims, SignerError};
pub use job::{Job, JobStatus, JobType};
pub use message::{MessageType, RawMessageType, IGNORE_UNKNOWN_TYPE_FLAG};
pub use node::{Node, NodeStatus, SchedulingEligibility};
pub use node_pool::NodePool;
pub use plan::{DesiredUpdates, Plan, PlanAnnotations, PlanResult};
pub use reschedule::{DelayFunction, ReschedulePolicy, RescheduleTracker};
pub use resources::{AllocatedResources, ComparableResources, NodeResources, Resources};
pub use task::Task;
pub use task_group::TaskGroup;
pub use workload_identity::{WIHandle, WorkloadIdentity};
