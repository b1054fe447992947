//! Network transport primitives.
//!
//! Provides the endpoint type and non-blocking TCP abstractions for the
//! balancer's poll loop. The dispatcher and worker harness use plain
//! blocking sockets and only share the [`Endpoint`] type.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::{Conn, Listener, ReadStatus};
