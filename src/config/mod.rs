pub mod loader;
pub mod models;
pub mod validation;

pub use models::{
    BreakerConfig, CollectorConfig, DefaultsConfig, ExecutionStrategy, FallbackConfig,
    GatewayConfig, MailboxConfig, MailboxStoreKind, OptimizerConfig, PoolConfig, RouteConfig,
    ServiceConfig, TransportKind,
};
pub use validation::GatewayConfigValidator;
