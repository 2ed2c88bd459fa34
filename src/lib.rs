//! Metadata layer of an object store: key scheme, transactional store
//! adapters, entity services, and the reconciliation pass that finds
//! orphaned multipart fragments.

pub mod config;
pub mod errors;
pub mod keys;
pub mod models;
pub mod services;
pub mod store;

pub use errors::{MetaError, MetaResult};
