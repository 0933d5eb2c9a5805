//! # fleet-testing
//!
//! Canonicalized fixtures shared by integration tests across the workspace.
//!
//! Every fixture passes its own validation and fits on [`mock::node`], so a
//! test only spells out the fields it cares about.

pub mod mock;
