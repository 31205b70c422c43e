//! Shared metric types for the telemon agent.
//!
//! The local endpoint serves, and the broker pulls, a flat JSON document of
//! metric names to typed values. Everything that produces or forwards
//! metrics speaks in terms of [`types::Metrics`].

pub mod types;
