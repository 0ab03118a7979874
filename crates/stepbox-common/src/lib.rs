//! # stepbox-common
//!
//! Shared constants, error definitions, wire types, and tunable limits
//! used across the entire stepbox workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives that the runtime and the
//! server build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
