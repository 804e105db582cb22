//! Database layer - connection pooling, identifier safety and catalog queries

pub mod ident;
pub mod pool;

pub use ident::{quote_ident, safe_ident};
pub use pool::Pool;
