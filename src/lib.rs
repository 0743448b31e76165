//! Tollgate - a resilient API gateway with adaptive concurrency control.
//!
//! Tollgate fronts a set of downstream HTTP services and guards every call with
//! a **bulkhead** (a bounded concurrency pool), a **circuit breaker** and a
//! timeout budget. It implements a **hexagonal architecture**: business logic
//! lives in `core`, traits (`ports`) describe the outside world, and `adapters`
//! implement them.
//!
//! # Features
//! - Path-prefix routing of `/gateway/{service}/...` onto configured downstreams
//! - Per-route resilience pools: dedicated, named shared, or service-wide shared
//! - Circuit breaking with half-open probing per pool
//! - Three call semantics: inline, polling and callback, backed by a durable
//!   mailbox (in-memory or Redis)
//! - Adaptive optimization: a collector samples pool utilization and latency,
//!   an updater grows concurrency limits and retunes timeouts live
//! - Live configuration hot-reload (file watch or HTTP polling) & validation
//! - Metrics via the `metrics` facade & structured JSON tracing
//! - Graceful shutdown on SIGTERM / SIGINT / SIGUSR1
//!
//! # Quick Example
//! ```no_run
//! use tollgate::config::GatewayConfig;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg: GatewayConfig = tollgate::config::loader::load_config("config.yaml").await?;
//! println!("{} services configured", cfg.services.len());
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-path failures use the domain error `core::error::GatewayError`,
//! which maps onto HTTP statuses at the edge. Startup and adapter construction
//! return `eyre::Result<T>` with context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! The live configuration is an `Arc<ArcSwap<GatewayConfig>>` snapshot that is
//! replaced wholesale, never mutated in place. Shared mutable maps use
//! `scc::HashMap` for predictable behaviour under contention.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;
pub mod optimizer;

// Re-export the types the binary crate wires together.
pub use crate::{
    adapters::{
        config_providers::{FileConfigProvider, HttpConfigProvider},
        http_transport::HyperTransport,
        memory_store::InMemoryMailboxStore,
        redis_store::RedisMailboxStore,
    },
    core::{
        callback::CallbackDispatcher, executor::CommandExecutor, mailbox::MailboxController,
        registry::ResilienceRegistry,
    },
    optimizer::{ConfigUpdater, MetricsCache, MetricsCollector},
    ports::transport::DownstreamTransport,
    utils::GracefulShutdown,
};
