// Library interface for testing

// Declare all modules
pub mod api;
pub mod capture;
pub mod chunk_store;
pub mod config;
pub mod constants;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod queries;
pub mod recording;
pub mod recovery;
pub mod remote_api;
pub mod remote_mapping;
pub mod room;
pub mod schema;
pub mod serve;
pub mod upload_queue;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
pub use error::{Result, SyncError};
