pub mod breaker;
pub mod bulkhead;
pub mod callback;
pub mod error;
pub mod executor;
pub mod mailbox;
pub mod registry;
pub mod resolve;
pub mod trace;
