//! Shared types for the stowage asset storage & lifecycle engine: the data
//! model, the pure placement rule engine, the backend adapter trait, and the
//! engine-wide error taxonomy. No I/O lives in this crate.

pub mod backend;
pub mod error;
pub mod model;
pub mod rules;

pub use backend::{BackendAdapter, BackendError, ObjectInfo};
pub use error::EngineError;
