use crate::pipeline::batch::{BatchOptions, DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
use crate::pipeline::windows::Strictness;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            engine: EngineConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Engine defaults; a pipeline definition's own batch settings take precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub batch_timeout: Option<Duration>,
    pub strict: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            batch_timeout: None,
            strict: false,
        }
    }
}

impl EngineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            batch_size: positive("ACUITY_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            workers: positive("ACUITY_WORKERS")?.unwrap_or(defaults.workers),
            batch_timeout: positive("ACUITY_BATCH_TIMEOUT_SECS")?
                .map(|secs| Duration::from_secs(secs as u64)),
            strict: flag("ACUITY_STRICT")?.unwrap_or(defaults.strict),
        })
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            size: self.batch_size,
            workers: self.workers,
            timeout: self.batch_timeout,
            strictness: if self.strict {
                Strictness::Strict
            } else {
                Strictness::Lenient
            },
        }
    }
}

fn positive(variable: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(variable) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => Ok(Some(parsed)),
            _ => Err(ConfigError::InvalidNumber { variable, value }),
        },
        Err(_) => Ok(None),
    }
}

fn flag(variable: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(variable) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidFlag { variable, value }),
        },
        Err(_) => Ok(None),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { variable: &'static str, value: String },
    InvalidFlag { variable: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { variable, value } => {
                write!(f, "{variable} must be a positive integer, got '{value}'")
            }
            ConfigError::InvalidFlag { variable, value } => {
                write!(f, "{variable} must be true or false, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidFlag { .. } => None,
        }
    }
}
