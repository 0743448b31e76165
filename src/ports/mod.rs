pub mod config_provider;
pub mod mailbox_store;
pub mod transport;
