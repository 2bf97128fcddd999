mod config_repository;
mod sync_store;

pub use config_repository::ConfigRepository;
pub use sync_store::SyncStore;
