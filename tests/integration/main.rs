//! Integration test binary -- all integration tests consolidated into a single
//! binary.
//!
//! See the matklad pattern: <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod control_roundtrip;
#[cfg(unix)]
mod provisioning;
#[cfg(unix)]
mod shutdown_sequence;
#[cfg(unix)]
mod worker_lifecycle;
