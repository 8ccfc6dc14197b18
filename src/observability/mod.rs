//! Observability helpers
//!
//! The engine reports everything through `tracing`; this module only wires up
//! a subscriber for applications that want the default one.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, listener_span};
