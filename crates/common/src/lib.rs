//! Shared wire types for the porpulsion workspace.
//!
//! Everything two peers exchange (handshake bodies, channel frame payloads,
//! RemoteApp specs) lives here so both sides of a channel serialize
//! identically.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
