pub mod auth;
pub mod cache;
pub mod competition;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod esi;
pub mod locations;
pub mod locks;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod records;
pub mod resilience;
pub mod syncer;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
