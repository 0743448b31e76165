use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration, time::Instant};

use arc_swap::ArcSwap;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tollgate::{
    adapters::{
        config_providers::{FileConfigProvider, HttpConfigProvider},
        http_handler::{self, AppState},
        http_transport::HyperTransport,
        memory_store::InMemoryMailboxStore,
        redis_store::RedisMailboxStore,
    },
    config::{GatewayConfig, GatewayConfigValidator, MailboxStoreKind, TransportKind},
    core::{
        callback::CallbackDispatcher, executor::CommandExecutor, mailbox::MailboxController,
        registry::ResilienceRegistry,
    },
    metrics::{self, ExecutionMetrics},
    optimizer::{ConfigUpdater, MetricsCache, MetricsCollector},
    ports::{config_provider::ConfigProvider, mailbox_store::MailboxStore},
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(
            config_path.to_string(),
            Duration::from_secs(10),
        )))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

/// Whether any downstream opted out of certificate verification; the shared
/// connector is built once for the process.
fn accepts_invalid_certs(config: &GatewayConfig) -> bool {
    config.services.values().any(|svc| {
        matches!(
            svc.transport,
            TransportKind::Tls {
                danger_accept_invalid_certs: true
            }
        )
    })
}

async fn build_mailbox_store(config: &GatewayConfig) -> Result<Arc<dyn MailboxStore>> {
    let ttl = Duration::from_secs(config.mailbox.ttl_secs);
    match &config.mailbox.store {
        MailboxStoreKind::Memory => {
            tracing::info!("Using in-memory mailbox store (ttl: {:?})", ttl);
            Ok(Arc::new(InMemoryMailboxStore::new(ttl)))
        }
        MailboxStoreKind::Redis { url } => {
            tracing::info!("Connecting Redis mailbox store at {url} (ttl: {:?})", ttl);
            let store = RedisMailboxStore::connect(url, ttl)
                .await
                .context("Failed to connect Redis mailbox store")?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path).await;
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal server startup
        }
        _ => unreachable!(),
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed. \
            The application will proceed; ensure a crypto provider is effectively available.",
            e
        );
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider =
        create_config_provider(&config_path).context("Failed to create config provider")?;

    let initial_config: GatewayConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    GatewayConfigValidator::validate(&initial_config)
        .map_err(|e| eyre!("Configuration validation failed:\n{e}"))?;

    let config_holder = Arc::new(ArcSwap::new(Arc::new(initial_config)));

    let registry = {
        let config = config_holder.load();
        Arc::new(ResilienceRegistry::new(&config))
    };

    let transport = {
        let config = config_holder.load();
        Arc::new(
            HyperTransport::new(config.total_concurrency(), accepts_invalid_certs(&config))
                .context("Failed to create downstream transport")?,
        )
    };

    let execution_metrics = Arc::new(ExecutionMetrics::new());
    let executor = CommandExecutor::new(
        config_holder.clone(),
        registry.clone(),
        transport,
        execution_metrics.clone(),
    );

    let callbacks = Arc::new(CallbackDispatcher::new(
        executor.clone(),
        config_holder.clone(),
    ));

    let store = {
        let config = config_holder.load();
        build_mailbox_store(&config).await?
    };
    let mailbox = Arc::new(MailboxController::new(executor, store, callbacks));

    // Optimizer loop: the collector feeds the cache, the updater patches config.
    let cache = {
        let config = config_holder.load();
        Arc::new(MetricsCache::new(
            Duration::from_secs(config.collector.window_secs),
            Duration::from_secs(config.collector.bucket_secs),
        ))
    };
    MetricsCollector::new(
        config_holder.clone(),
        registry.clone(),
        execution_metrics.clone(),
        cache.clone(),
    )
    .spawn();
    ConfigUpdater::new(config_holder.clone(), registry.clone(), cache.clone()).spawn();

    // Config Watcher Task
    let config_holder_clone = config_holder.clone();
    let registry_for_watcher = registry.clone();
    let debounce_duration = Duration::from_secs(2);

    let mut notify_rx = config_provider.watch();
    let config_provider_for_watcher = config_provider.clone();
    let config_path_for_watcher = config_path.clone();

    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        while notify_rx.recv().await.is_some() {
            // Debounce
            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::info!("Debouncing config reload event. Still within cooldown period.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            last_reload_attempt_time = tokio::time::Instant::now();

            tracing::info!(
                "Attempting to reload configuration from {}",
                config_path_for_watcher
            );

            match config_provider_for_watcher.load_config().await {
                Ok(new_config) => {
                    if let Err(e) = GatewayConfigValidator::validate(&new_config) {
                        tracing::error!(
                            "Reloaded configuration failed validation: {}. Keeping old configuration.",
                            e
                        );
                        while notify_rx.try_recv().is_ok() {}
                        continue;
                    }

                    let new_config_arc = Arc::new(new_config);
                    config_holder_clone.store(new_config_arc.clone());
                    registry_for_watcher.rebuild(&new_config_arc);
                    metrics::increment_config_reload();
                    tracing::info!("Configuration reloaded and resilience registry rebuilt.");
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {}. Keeping old configuration.",
                        e
                    );
                }
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });

    // Create graceful shutdown manager
    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let addr: SocketAddr = {
        let config_ref = config_holder.load();
        config_ref
            .listen_addr
            .parse()
            .context("Failed to parse listen address")?
    };

    {
        let ch = config_holder.load();
        tracing::info!(
            "Starting Tollgate gateway on {} ({} services, {} total reserved concurrency)",
            ch.listen_addr,
            ch.services.len(),
            ch.total_concurrency()
        );
        println!(
            "Tollgate gateway listening on {} ({} services configured)",
            ch.listen_addr,
            ch.services.len()
        );
    }

    let state = Arc::new(AppState {
        config: config_holder.clone(),
        mailbox,
        registry,
        started_at: Instant::now(),
    });
    let app = http_handler::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Tollgate gateway server starting on {}", addr);

    let server_result = tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("Server error")
        },
        shutdown_reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", shutdown_reason);
            tracing::info!("Graceful shutdown completed");
            Ok(())
        }
    };

    server_result?;

    tracing_setup::shutdown_tracing();

    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use tollgate::config::loader::load_config;

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            let route_count: usize = config.services.values().map(|s| s.routes.len()).sum();
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.services.len());
            println!("   • Routes: {route_count}");
            println!("   • Reserved Concurrency: {}", config.total_concurrency());
            println!("   • Optimizer Enabled: {}", config.optimizer.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure service endpoints start with http:// or https://");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   • Check that named route pools are declared under the service");
            println!("   • Concurrency limits and thresholds must be greater than zero");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Tollgate Gateway Configuration

# The address to listen on
listen_addr: "127.0.0.1:8080"

# Fallbacks applied when a route or pool omits a value
defaults:
  timeout_ms: 5000
  concurrency: 16
  bulkhead_wait_ms: 100
  callback_timeout_ms: 10000
  breaker:
    failure_threshold: 5
    success_threshold: 2
    reset_ms: 30000

# Example downstream service
services:
  orders:
    endpoint: "http://localhost:3000"
    default_pool: shared
    pools:
      shared:
        concurrency: 24
        timeout_ms: 3000
    routes:
      list:
        path: /orders
        methods: [GET]
        shared_pool: true
      create:
        path: /orders/create
        methods: [POST]
        concurrency: 8
        timeout_ms: 2000

# Adaptive tuning (collector feeds the optimizer)
collector:
  enabled: true
  interval_secs: 10
optimizer:
  enabled: true
  interval_secs: 60
  max_threshold: 0.8
  multiplier: 1.5
  max_expansion_limit: 4.0

# Mailbox persistence for polling / callback call modes
mailbox:
  ttl_secs: 86400
  store:
    kind: memory
  # store:
  #   kind: redis
  #   url: "redis://127.0.0.1:6379"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'tollgate serve --config {config_path}' to start the server");
    Ok(())
}
