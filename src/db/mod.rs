//! Database module.
//!
//! SQLite storage for check history, the dataset registry, API keys and the
//! usage log, with embedded migrations.

mod keys;
mod models;
mod store;

pub use models::*;
pub use store::*;
