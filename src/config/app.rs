use serde::{Deserialize, Serialize};

use super::{
    CacheConfig, ConfigError, InvalidationConfig, ObservabilityConfig, RedisConfig,
    ResilienceConfig, Validate, invalid,
};

/// Prefix of environment variable overrides, e.g.
/// `PERMISSION_CACHE__REDIS__URL=redis://cache:6379`
pub const ENV_PREFIX: &str = "PERMISSION_CACHE";

/// Top-level configuration that aggregates all config modules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    #[serde(default)]
    pub app: AppMetadata,
    /// Distributed store connection
    #[serde(default)]
    pub redis: RedisConfig,
    /// Hybrid cache (TTLs, lock, compression, guards)
    #[serde(default)]
    pub cache: CacheConfig,
    /// Delayed invalidation queue and worker
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    /// Resilience primitive defaults and overrides
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Application metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Application environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Graceful shutdown timeout in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

// Default functions for AppMetadata
fn default_app_name() -> String {
    "lighter-permission-cache".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_environment(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Validate for AppMetadata {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("app.name cannot be empty"));
        }
        if self.environment.is_empty() {
            return Err(invalid("app.environment cannot be empty"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(invalid("app.shutdown_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // Validate all nested configurations
        self.app.validate()?;
        self.redis.validate()?;
        self.cache.validate()?;
        self.invalidation.validate()?;
        self.resilience.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

/// Load configuration from files and environment variables
///
/// Configuration loading follows this precedence (highest to lowest):
/// 1. Environment variables: PERMISSION_CACHE__REDIS__ENABLED=true
/// 2. config/local.toml (git-ignored, developer overrides)
/// 3. config/{APP_ENV}.toml (development/staging/production)
/// 4. config/default.toml (base defaults)
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};

    // Determine the environment
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

    // Build configuration with layered sources
    let config = Config::builder()
        // Layer 1: Base defaults
        .add_source(File::with_name("config/default").required(false))
        // Layer 2: Environment-specific overrides
        .add_source(File::with_name(&format!("config/{}", env)).required(false))
        // Layer 3: Local developer overrides (git-ignored)
        .add_source(File::with_name("config/local").required(false))
        // Layer 4: Environment variables (highest precedence)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Deserialize into AppConfig
    let app_config: AppConfig = config.try_deserialize()?;

    // Validate the configuration
    app_config.validate()?;

    Ok(app_config)
}
