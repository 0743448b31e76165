pub mod config_providers;
pub mod http_handler;
pub mod http_transport;
pub mod memory_store;
pub mod redis_store;
