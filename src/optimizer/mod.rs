pub mod collector;
pub mod updater;

pub use collector::{MetricsCache, MetricsCollector};
pub use updater::ConfigUpdater;
