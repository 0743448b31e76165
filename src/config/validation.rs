use std::net::SocketAddr;

use eyre::Result;
use url::Url;

use crate::config::models::{GatewayConfig, RouteConfig, ServiceConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Pool reference error: {message}")]
    PoolReference { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every error.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }

        for (name, service) in &config.services {
            Self::validate_service(name, service, &mut errors);
        }

        if config.optimizer.max_threshold <= 0.0 || config.optimizer.max_threshold > 1.0 {
            errors.push(ValidationError::InvalidField {
                field: "optimizer.max_threshold".to_string(),
                message: "must be in (0, 1]".to_string(),
            });
        }
        if config.optimizer.multiplier < 1.0 {
            errors.push(ValidationError::InvalidField {
                field: "optimizer.multiplier".to_string(),
                message: "must be >= 1.0".to_string(),
            });
        }
        if config.collector.bucket_secs == 0 || config.collector.window_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "collector".to_string(),
                message: "bucket_secs and window_secs must be non-zero".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig, errors: &mut Vec<ValidationError>) {
        if let Err(e) = Self::validate_url(&service.endpoint, &format!("service '{name}' endpoint"))
        {
            errors.push(e);
        }

        if service.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("services.{name}.routes"),
            });
        }

        if let Some(default_pool) = &service.default_pool {
            if !service.pools.contains_key(default_pool) {
                errors.push(ValidationError::PoolReference {
                    message: format!(
                        "service '{name}' default_pool '{default_pool}' is not declared in its pool group"
                    ),
                });
            }
        }

        for (api, route) in &service.routes {
            Self::validate_route(name, api, route, service, errors);
        }

        for (pool_name, pool) in &service.pools {
            if pool.concurrency == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("services.{name}.pools.{pool_name}.concurrency"),
                    message: "must be greater than 0".to_string(),
                });
            }
        }
    }

    fn validate_route(
        service: &str,
        api: &str,
        route: &RouteConfig,
        owner: &ServiceConfig,
        errors: &mut Vec<ValidationError>,
    ) {
        if !route.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{service}.routes.{api}.path"),
                message: "route paths must start with '/'".to_string(),
            });
        }

        if let Some(pool) = &route.pool {
            if !owner.pools.contains_key(pool) {
                errors.push(ValidationError::PoolReference {
                    message: format!(
                        "route '{service}.{api}' references pool '{pool}' which is not declared in the service pool group"
                    ),
                });
            }
        }

        if route.shared_pool && owner.default_pool.is_none() {
            errors.push(ValidationError::PoolReference {
                message: format!(
                    "route '{service}.{api}' is marked shared_pool but the service declares no default_pool"
                ),
            });
        }

        if route.concurrency == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{service}.routes.{api}.concurrency"),
                message: "must be greater than 0".to_string(),
            });
        }

        if route.timeout_ms == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{service}.routes.{api}.timeout_ms"),
                message: "must be greater than 0".to_string(),
            });
        }
    }

    fn validate_url(url: &str, field: &str) -> ValidationResult<()> {
        match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
            Ok(parsed) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("  {}. {e}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::{PoolConfig, TransportKind};

    fn valid_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        let mut routes = HashMap::new();
        routes.insert("list".to_string(), RouteConfig::new("/orders"));
        config.services.insert(
            "orders".to_string(),
            ServiceConfig {
                endpoint: "http://orders:8080".to_string(),
                transport: TransportKind::Plain,
                auth_header: None,
                routes,
                pools: HashMap::new(),
                default_pool: None,
            },
        );
        config
    }

    #[test]
    fn valid_config_passes() {
        assert!(GatewayConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn bad_listen_addr_rejected() {
        let mut config = valid_config();
        config.listen_addr = "not-an-addr".to_string();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn unknown_pool_reference_rejected() {
        let mut config = valid_config();
        config
            .services
            .get_mut("orders")
            .unwrap()
            .routes
            .get_mut("list")
            .unwrap()
            .pool = Some("ghost".to_string());
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn shared_pool_without_default_rejected() {
        let mut config = valid_config();
        config
            .services
            .get_mut("orders")
            .unwrap()
            .routes
            .get_mut("list")
            .unwrap()
            .shared_pool = true;
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn default_pool_must_be_declared() {
        let mut config = valid_config();
        config.services.get_mut("orders").unwrap().default_pool = Some("main".to_string());
        assert!(GatewayConfigValidator::validate(&config).is_err());

        config.services.get_mut("orders").unwrap().pools.insert(
            "main".to_string(),
            PoolConfig {
                concurrency: 4,
                initial_concurrency: None,
                timeout_ms: None,
                wait_ms: None,
            },
        );
        assert!(GatewayConfigValidator::validate(&config).is_ok());
    }
}
