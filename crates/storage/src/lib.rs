//! Storage abstractions for conflux services.
//!
//! Provides unified interfaces for:
//! - Scene queues (Redis Streams, in-memory) with visibility leases and dead-lettering
//! - Drill result stores (PostgreSQL upsert, JSON tables on object storage, in-memory)
//! - The dataset index (PostgreSQL) and band arrays on object storage (MinIO/S3/local)

pub mod catalog;
pub mod memory_queue;
pub mod object_store;
pub mod queue;
pub mod redis_queue;
pub mod results;
pub mod table_store;

pub use self::object_store::{ObjectStorage, ObjectStorageConfig, StoragePath};
pub use catalog::Catalog;
pub use memory_queue::{DeadLetter, MemoryQueue};
pub use queue::{dead_letter_name, FailOutcome, QueueConfig, SceneMessage, SceneQueue};
pub use redis_queue::RedisSceneQueue;
pub use results::{MemoryResultStore, PostgresResultStore, ResultStore};
pub use table_store::{DrillTable, TableStore};
