//! Delta sync and remote bootstrap

pub mod delta;
pub mod remote;

pub use delta::{compute_delta, format_since, parse_since, parse_types, DeltaResponse, EPOCH};
pub use remote::{apply_seed, fetch_remote_nodes, init_remote_sync, LocalAddress, RemoteSyncOutcome};
