//! # Nimbus Testkit
//!
//! Test utilities for Nimbus.
//!
//! This crate provides:
//! - An in-memory REST server implementing the client's transport
//! - A gated transport for interleaving concurrent requests
//! - Client fixtures and seeded data sets
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nimbus_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn saves_reach_the_server() {
//!     let (client, server) = memory_client();
//!     let ticket = client.object("Ticket").unwrap();
//!     ticket.set("status", "open").unwrap();
//!     ticket.save().await.unwrap();
//!     assert_eq!(server.len("Ticket"), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod gate;
pub mod generators;
mod matcher;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::gate::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use gate::*;
pub use generators::*;
pub use server::*;
