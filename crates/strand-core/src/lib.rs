//! strand-core: Schema model, validation, and shared plumbing for the Strand graph engine.
//!
//! This crate provides the foundations every Strand component builds on:
//! - The typed graph schema (node kinds, relationship kinds, props, indices)
//! - Schema validation and additive merging
//! - Storage key families and reserved record fields
//! - Configuration management
//! - The engine-wide error taxonomy

pub mod config;
pub mod error;
pub mod keys;
pub mod schema;
pub mod validate;

pub use error::{Result, StrandError};
pub use schema::Schema;
