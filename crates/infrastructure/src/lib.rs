//! # coordinator-infrastructure
//!
//! SQLite 持久化、任务队列与内容寻址 Blob 存储的具体实现。

pub mod blob_store;
pub mod database;
pub mod in_memory_queue;
pub mod sqlite_task_queue;
pub mod task_queue_factory;

pub use blob_store::{ContentAddressedBlobStore, FsBlobBackend, MemoryBlobBackend};
pub use database::*;
pub use in_memory_queue::InMemoryTaskQueue;
pub use sqlite_task_queue::SqliteTaskQueue;
pub use task_queue_factory::TaskQueueFactory;
