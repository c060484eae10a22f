//! Configuration management for the strata core
//!
//! Handles server settings, the data directory, scripting limits and the
//! schema repair budget.

use serde::{Deserialize, Serialize};

/// Date pattern shared by date properties and the template formatters
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Scripting engine configuration
    pub scripting: ScriptingConfig,
    /// Schema compiler configuration
    pub schema: SchemaConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory (default: "data")
    /// Creates: schema.db and files/{id}
    pub data_dir: String,
}

/// Scripting engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Capacity of the compiled-source cache
    pub source_cache_capacity: usize,
    /// chrono pattern used when formatting dates
    pub default_date_format: String,
}

/// Schema compiler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Upper bound on compile/repair iterations
    pub migration_attempts: usize,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("STRATA_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("STRATA_PORT")
                    .unwrap_or_else(|_| "3004".to_string())
                    .parse()
                    .unwrap_or(3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("STRATA_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            scripting: ScriptingConfig {
                source_cache_capacity: std::env::var("STRATA_SOURCE_CACHE_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000),
                default_date_format: std::env::var("STRATA_DATE_FORMAT")
                    .unwrap_or_else(|_| DEFAULT_DATE_FORMAT.to_string()),
            },
            schema: SchemaConfig {
                migration_attempts: std::env::var("STRATA_MIGRATION_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8),
            },
        }
    }
}
