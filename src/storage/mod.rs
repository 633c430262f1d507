pub mod deletion_log;
pub mod entity;
pub mod store;

pub use deletion_log::{
    DeletionEntry, DeletionLog, DeletionLogConfig, DeletionLogSnapshot, DeletionLogStats,
    SharedDeletionLog, spawn_cleanup_task,
};
pub use entity::{create_content_digest, Entity, RESERVED_KEYS};
pub use store::{ChangeEvent, ChangeKind, EntityStore, SharedStore};
