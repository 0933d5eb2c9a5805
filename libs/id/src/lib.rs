//! # fleet-id
//!
//! Typed identifiers and naming rules for the fleet scheduler core.
//!
//! ## Design Principles
//!
//! - Object IDs are opaque 128-bit values rendered as canonical UUID strings
//! - IDs are typed to prevent passing a node ID where an allocation ID is expected
//! - Persisted IDs are treated as opaque strings; only freshly parsed user
//!   input is held to the canonical UUID form
//! - Job IDs are user-chosen and follow their own rules
//!
//! ## ID Format
//!
//! Generated IDs are lowercase hyphenated UUIDs:
//!
//! - `2f6a1c3e-8a4b-4c1d-9e2f-0b7d5a6c8e91`
//!
//! User-visible names (node pools, workload identities, actions) must match
//! `^[a-zA-Z0-9-_]{1,128}$`, see [`validate_name`].

mod error;
mod macros;
mod name;
mod types;

pub use error::IdError;
pub use name::{is_valid_name, validate_name, MAX_NAME_LENGTH};
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
