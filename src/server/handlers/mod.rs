pub mod nodes;
pub mod sync;
pub mod webhooks;
pub mod websocket;

pub use nodes::{get_node, health, list_nodes};
pub use sync::get_sync;
pub use webhooks::receive_webhook;
pub use websocket::replication_ws;
