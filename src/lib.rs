pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod references;
pub mod replication;
pub mod server;
pub mod source;
pub mod storage;
pub mod sync;
pub mod webhooks;

pub use cache::CacheManager;
pub use config::SyncConfig;
pub use context::{SyncContext, SyncNotice};
pub use error::{SyncError, SyncResult};
pub use server::{create_router, AppState};
pub use source::{JsonFileSource, SourceActions, SourcePlugin, SyncStrategy};
pub use storage::{ChangeEvent, DeletionLog, Entity, EntityStore};
