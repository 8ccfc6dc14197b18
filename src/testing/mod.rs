//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the client without
//! requiring a message broker or a configuration endpoint.

pub mod mocks;

pub use mocks::*;
