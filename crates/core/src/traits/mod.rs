pub mod blob_store;
pub mod repository;
pub mod task_queue;

pub use blob_store::*;
pub use repository::*;
pub use task_queue::*;
