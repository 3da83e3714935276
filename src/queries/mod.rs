pub mod chunks;
pub mod ddl;
pub mod metadata;
pub mod recordings;
pub mod remote_mappings;
pub mod rooms;
pub mod upload_states;
