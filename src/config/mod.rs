pub mod app;
pub mod cache;
pub mod invalidation;
pub mod observability;
pub mod resilience;
pub mod store;

pub use app::{AppConfig, AppMetadata, load_config};
pub use cache::CacheConfig;
pub use invalidation::InvalidationConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use resilience::{
    BulkheadConfig, CircuitBreakerConfig, LimitSpec, PrimitiveConfig, PrimitiveKind,
    RateLimiterConfig, ResilienceConfig,
};
pub use store::RedisConfig;

/// Errors produced while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Configuration sections check their own invariants
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Load the application configuration from files and environment variables
pub fn load() -> Result<AppConfig, ConfigError> {
    app::load_config()
}

pub(crate) fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
