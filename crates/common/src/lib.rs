//! Shared wire types for the pulsemon workspace.
//!
//! Keep cross-crate DTOs here so the controller and agent agree on the
//! upgrade and result-pipeline payloads without duplication.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
