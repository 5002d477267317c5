//! Integration test crate for Tessera.
//!
//! This crate exists solely for integration testing. It is `publish = false`
//! and has no library code: the tests live in `tests/` and drive real plugin
//! processes built from the `stub-plugin` binary.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
