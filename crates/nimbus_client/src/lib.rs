//! # Nimbus Client
//!
//! Async client for a Nimbus REST backend.
//!
//! This crate provides:
//! - Entities with dirty tracking, pending operations and save/fetch/destroy
//! - Relations between entities
//! - A fluent query builder with find, count, get, each, distinct and aggregate
//! - File uploads, roles and users
//! - Per-entity change events
//! - A pluggable transport, with an HTTP implementation over any [`HttpClient`]
//!
//! ## Architecture
//!
//! A [`Client`] carries the configuration, the class registry and one
//! shared [`Transport`]. Entities and queries describe requests as a
//! method, a path and a JSON body; the transport owns credentials and
//! the server URL.
//!
//! ## Key Invariants
//!
//! - Local validation errors never reach the transport
//! - Responses are decoded in full before any entity state changes
//! - Saves of one entity go out one at a time, each with the operations
//!   recorded before it was called
//! - Failed saves keep their operations pending
//! - Nothing retries

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod entity;
mod error;
mod events;
mod file;
mod http;
mod query;
mod relation;
mod role;
mod transport;
mod user;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_BATCH_SIZE};
pub use entity::{Entity, EntityState};
pub use error::{ClientError, ClientResult, ErrorCode, TransportError};
pub use events::{EntityEvent, EntityEvents, EVENT_BUFFER};
pub use file::{FileRef, DEFAULT_CONTENT_TYPE};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, HttpTransport, LoopbackClient, APPLICATION_ID_HEADER,
    REST_KEY_HEADER, SESSION_TOKEN_HEADER,
};
pub use query::{FullTextOptions, Query};
pub use relation::Relation;
pub use role::{Role, ROLE_CLASS, USER_CLASS};
pub use transport::{Body, Method, MockTransport, Request, Response, Transport};
pub use user::User;

pub use nimbus_codec::{FileDescriptor, GeoPoint, Json, Pointer, Value};
pub use nimbus_core::{AccessMode, Acl, ClassSpec, CoreError, Operation, Principal, ValueKind};
