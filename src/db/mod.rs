//! Database module: row models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions for id mappings and stored credentials.

pub mod model;
pub mod repo;

pub use model::{IdMapping, StoredCredentials};
pub use repo::*;
