//! Sandbox container lifecycle for the stepbox service.
//!
//! A [`pool::ContainerPool`] keeps warm [`container::Container`]s ready;
//! each one is checked out by exactly one run, fed the framed
//! [`protocol::WirePayload`] on stdin, and closed afterwards.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod listing;
pub mod output;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod registry;
