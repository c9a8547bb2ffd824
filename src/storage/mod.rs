pub mod cached;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedLocations;
pub use sqlite::SqliteStorage;
pub use trait_def::{GeoRepository, StorageError, StorageResult};
