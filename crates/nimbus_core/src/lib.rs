//! # Nimbus Core
//!
//! Local object model for Nimbus.
//!
//! This crate provides:
//! - Attribute store with clean/current snapshots and dirty tracking
//! - Pending operations and the per-entity operation log
//! - Access control lists and their evaluation
//! - Class registry (defaults and attribute kinds)
//!
//! Nothing here performs I/O; the client crate drives these types
//! against a transport.
//!
//! ## Key Invariants
//!
//! - At most one pending operation per attribute key
//! - Recording an incompatible operation leaves the log unchanged
//! - Compiling the log is pure and deterministic
//! - Reserved keys are never written through generic setters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod acl;
mod attributes;
mod error;
pub mod keys;
mod operation;
mod oplog;
mod registry;

pub use acl::{AccessMode, Acl, Permissions, Principal, PUBLIC};
pub use attributes::AttributeStore;
pub use error::{CoreError, CoreResult};
pub use operation::{Operation, RelationChange};
pub use oplog::{compile_set, OperationLog, OperationSet};
pub use registry::{ClassRegistry, ClassSpec, ValueKind};
