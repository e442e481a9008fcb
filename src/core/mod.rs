/// Core Module
///
/// Shared infrastructure of the access layer: the error taxonomy and the
/// low-level database plumbing (connection, statement execution, schema
/// introspection, backend error translation).

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{Result, SessionError};
