//! Shared types for the fleet-bridge workspace.
//!
//! Wire-level documents of the fleet-management backend live here so that the
//! bridge and its test fixtures agree on one representation.

#![warn(missing_docs)]

/// Fleet backend REST documents.
pub mod api;
