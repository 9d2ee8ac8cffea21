//! Runtime configuration for the delivery core.
//!
//! # Contract
//! - Every setting is resolved from the environment exactly once, at startup,
//!   via [`AppConfig::resolve_from_env`].
//! - Callers pass the resolved struct into constructors; never scatter
//!   `std::env::var` calls through the rest of the workspace.
//! - `Debug` redacts `redis_password`. Error messages name the env var, never
//!   its value.

use anyhow::{Context, Result};

/// Connection settings for the distributed Registry (§6).
#[derive(Clone)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// `"redis"` or `"rediss"` (TLS).
    pub scheme: String,
    pub cluster: bool,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<REDACTED>"))
            .field("scheme", &self.scheme)
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl RegistryConfig {
    /// Build a `redis://[:password@]host:port` URL for `redis::Client::open`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("{}://:{}@{}:{}", self.scheme, pw, self.host, self.port),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }

    fn resolve_from_env() -> Result<Self> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match std::env::var("REDIS_PORT") {
            Ok(v) => v
                .parse()
                .with_context(|| "REDIS_PORT is set but is not a valid port number")?,
            Err(_) => 6379,
        };
        let password = std::env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty());
        let scheme = std::env::var("REDIS_SCHEME").unwrap_or_else(|_| "redis".to_string());
        let cluster = std::env::var("REDIS_CLUSTER")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        Ok(Self {
            host,
            port,
            password,
            scheme,
            cluster,
        })
    }
}

/// Connection settings for the SQL persistence layer (§5, §6).
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// DSN for the read pool.
    pub read_url: String,
    /// DSN for the write pool; defaults to `read_url` unless `DATABASE_WRITE_URL` is set.
    pub write_url: String,
    pub read_pool_size: u32,
    pub write_pool_size: u32,
}

impl DbConfig {
    fn resolve_from_env() -> Result<Self> {
        let read_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let write_url = std::env::var("DATABASE_WRITE_URL").unwrap_or_else(|_| read_url.clone());
        let read_pool_size = match std::env::var("DB_READ_POOL_SIZE") {
            Ok(v) => v
                .parse()
                .context("DB_READ_POOL_SIZE is set but is not a valid integer")?,
            Err(_) => 15,
        };
        let write_pool_size = match std::env::var("DB_WRITE_POOL_SIZE") {
            Ok(v) => v
                .parse()
                .context("DB_WRITE_POOL_SIZE is set but is not a valid integer")?,
            Err(_) => 5,
        };
        Ok(Self {
            read_url,
            write_url,
            read_pool_size,
            write_pool_size,
        })
    }
}

/// Bind address and optional TLS material for the Axum listener (SPEC_FULL §2.1).
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub bind_addr: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl DaemonConfig {
    fn resolve_from_env() -> Self {
        let bind_addr =
            std::env::var("WS_ADDR").unwrap_or_else(|_| "0.0.0.0:9502".to_string());
        let tls_cert_path = std::env::var("WS_TLS_CERT").ok().filter(|v| !v.is_empty());
        let tls_key_path = std::env::var("WS_TLS_KEY").ok().filter(|v| !v.is_empty());
        Self {
            bind_addr,
            tls_cert_path,
            tls_key_path,
        }
    }

    /// `true` only when both cert and key paths are set *and* point at
    /// readable files — falls back to plaintext with a warning otherwise
    /// (SPEC_FULL §2.1 step 7).
    pub fn tls_material_readable(&self) -> bool {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => {
                std::path::Path::new(cert).is_file() && std::path::Path::new(key).is_file()
            }
            _ => false,
        }
    }
}

/// Everything the daemon binary needs at startup, resolved once.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub db: DbConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn resolve_from_env() -> Result<Self> {
        Ok(Self {
            registry: RegistryConfig::resolve_from_env()
                .context("failed to resolve Registry configuration")?,
            db: DbConfig::resolve_from_env().context("failed to resolve database configuration")?,
            daemon: DaemonConfig::resolve_from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-global; tests that mutate them run
    // serially under a single lock so they can't interleave with each other.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn registry_url_redacts_nothing_but_debug_does() {
        let _guard = ENV_LOCK.lock().unwrap();
        let cfg = RegistryConfig {
            host: "cache.internal".into(),
            port: 6380,
            password: Some("s3cr3t".into()),
            scheme: "rediss".into(),
            cluster: false,
        };
        assert_eq!(cfg.url(), "rediss://:s3cr3t@cache.internal:6380");
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("<REDACTED>"));
    }

    #[test]
    fn db_config_defaults_write_pool_to_read_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DATABASE_URL", "postgres://localhost/app");
        std::env::remove_var("DATABASE_WRITE_URL");
        std::env::remove_var("DB_READ_POOL_SIZE");
        std::env::remove_var("DB_WRITE_POOL_SIZE");
        let cfg = DbConfig::resolve_from_env().unwrap();
        assert_eq!(cfg.write_url, cfg.read_url);
        assert_eq!(cfg.read_pool_size, 15);
        assert_eq!(cfg.write_pool_size, 5);
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn daemon_config_defaults_bind_addr() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("WS_ADDR");
        let cfg = DaemonConfig::resolve_from_env();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9502");
        assert!(!cfg.tls_material_readable());
    }
}
