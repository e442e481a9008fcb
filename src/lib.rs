// Core infrastructure modules
pub mod config;
pub mod core;

// Session components
pub mod cache;
pub mod filters;
pub mod hooks;
pub mod session;
pub mod shaper;
pub mod transaction;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_utils;

pub use crate::core::{Result, SessionError};
pub use crate::filters::{Fields, Filters, Operator, OrderBy, Predicate};
pub use crate::session::{ExecuteOptions, LookupOptions, Session};
pub use crate::shaper::{LookupValue, QueryOutput, Record};
