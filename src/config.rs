//! Process configuration
//!
//! Configuration is created once at startup and injected into every client
//! and component constructor; nothing reads credentials or endpoints from
//! global state after this point.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Control-plane credentials
#[derive(Clone, Debug)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Pluggable credential backend, selected by explicit configuration
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Reads credentials from environment variables
pub struct EnvCredentials {
    pub id_var: String,
    pub secret_var: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self {
            id_var: "FLEET_ACCESS_KEY_ID".to_string(),
            secret_var: "FLEET_SECRET_ACCESS_KEY".to_string(),
        }
    }
}

impl CredentialsProvider for EnvCredentials {
    fn credentials(&self) -> Result<Credentials> {
        let read = |var: &str| {
            std::env::var(var)
                .map_err(|_| Error::ConfigError(format!("environment variable {var} is not set")))
        };
        Ok(Credentials {
            access_key_id: read(&self.id_var)?,
            secret_access_key: read(&self.secret_var)?,
        })
    }
}

/// Credentials supplied directly, mainly for tests
pub struct StaticCredentials(pub Credentials);

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Reads credentials from a TOML file with `access_key_id` and
/// `secret_access_key` keys
pub struct FileCredentials {
    pub path: PathBuf,
}

#[derive(Deserialize)]
struct CredentialsFile {
    access_key_id: String,
    secret_access_key: String,
}

impl CredentialsProvider for FileCredentials {
    fn credentials(&self) -> Result<Credentials> {
        let raw = std::fs::read_to_string(&self.path)?;
        let file: CredentialsFile = toml::from_str(&raw).map_err(|e| {
            Error::ConfigError(format!(
                "invalid credentials file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Credentials {
            access_key_id: file.access_key_id,
            secret_access_key: file.secret_access_key,
        })
    }
}

/// Immutable process-wide configuration, injected not looked up
#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub credentials: Credentials,
    /// Base domain for control-plane endpoints, e.g. `cloud.example.net`
    pub provider_domain: String,
    /// Local trust store consumed by the SSH transport
    pub known_hosts_path: PathBuf,
    /// Where temporary key-pair material is written (mode 0600)
    pub temp_dir: PathBuf,
}

impl FleetConfig {
    pub fn new(provider: &dyn CredentialsProvider, provider_domain: &str) -> Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Ok(Self {
            credentials: provider.credentials()?,
            provider_domain: provider_domain.to_string(),
            known_hosts_path: Path::new(&home).join(".ssh/known_hosts"),
            temp_dir: std::env::temp_dir(),
        })
    }

    /// Compute control plane for a region
    pub fn compute_endpoint(&self, region: &str) -> String {
        format!("https://{region}.compute.{}", self.provider_domain)
    }

    /// Load-balancer control plane for a region
    pub fn load_balancer_endpoint(&self, region: &str) -> String {
        format!("https://{region}.elb.{}", self.provider_domain)
    }

    /// Hosted-zone/DNS control plane (global, not regional)
    pub fn dns_endpoint(&self) -> String {
        format!("https://dns.{}", self.provider_domain)
    }
}
