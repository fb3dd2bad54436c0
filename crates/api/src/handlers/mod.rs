pub mod blobs;
pub mod decisions;
pub mod health;
pub mod scheduler;
pub mod tasks;
