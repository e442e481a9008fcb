/// Database Module
///
/// Low-level database plumbing, organized into focused submodules.
///
/// ## Architecture
///
/// - **Connection Management** (`connection.rs`): owns the physical handle, opens it lazily
/// - **Statement Execution** (`query.rs`): values, parameters, raw result sets, statement kinds
/// - **Schema Introspection** (`schema.rs`): tables, columns and column types
/// - **Error Translation** (`classify.rs`): backend error codes to `SessionError` variants
///
/// ## Error Handling
///
/// Driver errors are translated exactly once, in `connection.rs`, through the
/// `ErrorTranslator` of the active backend.
pub mod classify;
pub mod connection;
pub mod query;
pub mod schema;

pub use classify::*;
pub use connection::*;
pub use query::*;
pub use schema::*;
