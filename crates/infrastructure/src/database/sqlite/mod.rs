pub mod sqlite_blob_repository;
pub mod sqlite_job_repository;
pub mod sqlite_progress_repository;
pub mod sqlite_registry_repository;
pub mod sqlite_task_repository;

pub use sqlite_blob_repository::SqliteBlobRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_progress_repository::SqliteProgressRepository;
pub use sqlite_registry_repository::SqliteRegistryRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
