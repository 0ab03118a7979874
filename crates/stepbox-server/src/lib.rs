//! HTTP front end for the stepbox sandbox.
//!
//! Accepts pre-compiled binaries on `/run`, executes each in a fresh
//! container checked out of the warm pool, and reports the captured
//! execution steps and exit code. The same binary also serves as the
//! program inside the container (`--mode contained`).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod contained;
pub mod coordinator;
pub mod health;
pub mod http;
pub mod service;
