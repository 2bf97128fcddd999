mod json_config_repo;
mod memory_sync_store;
mod sqlite_sync_store;

pub use json_config_repo::{JsonConfigRepository, MemoryConfigRepository};
pub use memory_sync_store::MemorySyncStore;
pub use sqlite_sync_store::SqliteSyncStore;
