//! # Huddle Common Library
//!
//! Shared code for every huddle node:
//! - Identifier newtypes (tenant, user, connection, ...)
//! - Event types and the node-local EventBus
//! - Shared State Store traits with in-memory and SQLite backends
//! - Configuration loading
//! - SSE frame helpers and time utilities

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod sse;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use ids::{ConnectionId, ProductId, TenantId, UserId};
