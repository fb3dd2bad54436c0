pub mod manager;
pub mod mapping;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use mapping::MappingHelpers;
pub use sqlite::{
    SqliteBlobRepository, SqliteJobRepository, SqliteProgressRepository,
    SqliteRegistryRepository, SqliteTaskRepository,
};
