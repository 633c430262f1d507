//! Live replication between an origin and its followers

pub mod client;
pub mod guard;
pub mod protocol;
pub mod server;

pub use client::{
    apply_message, origin_endpoint, websocket_url, ReplicationClient, ReplicationClientConfig,
    WebhookCallback,
};
pub use guard::is_self_reference;
pub use protocol::{MessageKind, ReplicationMessage, WebhookNotice, WILDCARD};
pub use server::{handle_socket, ReplicationHub, Subscriptions};
