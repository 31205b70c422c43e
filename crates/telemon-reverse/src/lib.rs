//! Reverse connections to metrics brokers.
//!
//! The agent dials out to the broker over TLS and holds the channel open;
//! the broker then pulls metric snapshots through it on demand. Firewalls
//! and NAT stay closed because every byte of the channel rides an
//! agent-initiated connection.
//!
//! [`Reverse`] is the supervisor loop; it owns broker discovery and runs
//! one [`connection::Connection`] at a time. The connection speaks the
//! framed command protocol in [`codec`] and answers broker requests by
//! replaying them against the agent's own metrics endpoint via
//! [`dispatcher::Dispatcher`].

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
mod supervisor;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionOpts, ConnectionState};
pub use error::OpError;
pub use supervisor::{Reverse, ReverseOpts};
