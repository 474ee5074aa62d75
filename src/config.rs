use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/simplify/config.yaml";

/// Deployment environment. Controls log defaults, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Development,
    Production,
}

impl Default for Env {
    fn default() -> Self {
        Env::Development
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Env::Development => f.write_str("development"),
            Env::Production => f.write_str("production"),
        }
    }
}

impl FromStr for Env {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" => Ok(Env::Development),
            "production" => Ok(Env::Production),
            other => Err(Error::invalid_field(
                "env",
                format!("env must be development or production, got {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: Env,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub caddy: CaddyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: Env::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            caddy: CaddyConfig::default(),
        }
    }
}

/// All timeouts are seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: 15,
            write_timeout: 15,
            idle_timeout: 60,
            shutdown_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/simplify/simplify.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaddyConfig {
    pub enabled: bool,
    pub image: String,
    pub data_dir: String,
    /// Optional host path with a prebuilt frontend, mounted read-only.
    pub frontend_path: String,
    pub proxy_network: String,
    pub admin_port: u16,
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "docker.io/library/caddy:2-alpine".to_owned(),
            data_dir: "/var/lib/simplify/caddy".to_owned(),
            frontend_path: String::new(),
            proxy_network: "simplify-proxy".to_owned(),
            admin_port: 2019,
            http_port: 80,
            https_port: 443,
        }
    }
}

impl Config {
    /// Read the config file, creating it with placeholder defaults when
    /// missing, then fold in `SIMPLIFY_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read(path).map_err(|err| {
                Error::internal(format!("failed to read config {}", path.display()))
                    .with_source(err)
            })?;
            serde_yaml::from_slice(&raw).map_err(|err| {
                Error::invalid_input(format!("failed to parse config {}", path.display()))
                    .with_source(err)
            })?
        } else {
            let defaults = Self::default();
            defaults.write_placeholder(path)?;
            defaults
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn write_placeholder(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::internal(format!("failed to create {}", parent.display())).with_source(err)
            })?;
        }
        let rendered = serde_yaml::to_string(self)
            .map_err(|err| Error::internal("failed to render default config").with_source(err))?;
        std::fs::write(path, rendered).map_err(|err| {
            Error::internal(format!("failed to write {}", path.display())).with_source(err)
        })
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("SIMPLIFY_ENV") {
            self.env = env.parse()?;
        }
        if let Ok(port) = std::env::var("SIMPLIFY_SERVER_PORT") {
            self.server.port = port.parse().map_err(|err| {
                Error::invalid_field("server.port", format!("invalid SIMPLIFY_SERVER_PORT {port:?}"))
                    .with_source(err)
            })?;
        }
        if let Ok(path) = std::env::var("SIMPLIFY_DATABASE_PATH") {
            self.database.path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::invalid_field("server.port", "port must be in [1, 65535]"));
        }
        if self.database.path.is_empty() {
            return Err(Error::invalid_field("database.path", "database path must not be empty"));
        }
        for (name, value) in [
            ("server.read_timeout", self.server.read_timeout),
            ("server.write_timeout", self.server.write_timeout),
            ("server.idle_timeout", self.server.idle_timeout),
            ("server.shutdown_timeout", self.server.shutdown_timeout),
        ] {
            if value == 0 {
                return Err(Error::invalid_field(name, "timeout must be greater than zero"));
            }
        }
        Ok(())
    }
}
