//! `accessgate-core`: identifiers and error primitives shared by every gate crate.
//!
//! This crate carries **no I/O** and no async runtime.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{TenantId, UserId};
