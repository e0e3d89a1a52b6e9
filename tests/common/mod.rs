//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Topology builders for small parent/child trees
//! - Scripted child replies (READY / ERROR / COMPLETE)
//! - Transports with controllable failure behavior
//! - A pump that delivers recorded traffic between two routers

#![allow(dead_code)]

pub mod network;
pub mod scripted;

pub use network::*;
pub use scripted::*;
