//! Declared load-balancer configuration
//!
//! A `LoadBalancerSpec` is reconciled against live state, never replaced:
//! membership and zones are diffed, listeners are replaced wholesale, cookie
//! policies are torn down and rebuilt.

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Ssl,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
        };
        write!(f, "{s}")
    }
}

/// One protocol/port pair forwarded by the load balancer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub protocol: Protocol,
    pub load_balancer_port: u16,
    pub instance_port: u16,
}

/// Default listener set when a spec declares none: plain HTTP on port 80
pub fn default_listeners() -> Vec<Listener> {
    vec![Listener {
        protocol: Protocol::Http,
        load_balancer_port: 80,
        instance_port: 80,
    }]
}

/// Session-affinity policy for a set of listener ports
///
/// `Disabled` is deliberately a no-op during policy rebuild: the
/// unconditional teardown step is what clears previously active ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum StickyCookiePolicy {
    Disabled {
        ports: Vec<u16>,
    },
    LbGenerated {
        ports: Vec<u16>,
        expiration_secs: u64,
    },
    AppGenerated {
        ports: Vec<u16>,
        cookie_name: String,
    },
}

impl StickyCookiePolicy {
    pub fn ports(&self) -> &[u16] {
        match self {
            StickyCookiePolicy::Disabled { ports }
            | StickyCookiePolicy::LbGenerated { ports, .. }
            | StickyCookiePolicy::AppGenerated { ports, .. } => ports,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports().is_empty() {
            return Err(Error::ConfigError(
                "sticky-cookie policy is missing ports".to_string(),
            ));
        }
        match self {
            StickyCookiePolicy::AppGenerated { cookie_name, .. } if cookie_name.is_empty() => Err(
                Error::ConfigError("app-generated sticky policy is missing cookie_name".to_string()),
            ),
            StickyCookiePolicy::LbGenerated {
                expiration_secs: 0, ..
            } => Err(Error::ConfigError(
                "lb-generated sticky policy is missing expiration_secs".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Health-check configuration, merged over defaults and always pushed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    /// Probe target, e.g. `TCP:80` or `HTTP:80/status`
    pub target: String,
    pub timeout_secs: u32,
    pub interval_secs: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 10,
            unhealthy_threshold: 3,
            target: "TCP:80".to_string(),
            timeout_secs: 5,
            interval_secs: 30,
        }
    }
}

/// Declared load balancer and its membership filters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub region: String,
    /// When non-empty, only these servers are balanced
    #[serde(default)]
    pub only: Vec<String>,
    /// Servers excluded from balancing
    #[serde(default)]
    pub except: Vec<String>,
    #[serde(default = "default_listeners")]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub sticky_cookies: Vec<StickyCookiePolicy>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// DNS name aliased to the load balancer's canonical target
    #[serde(default)]
    pub dns_alias: Option<String>,
}

impl LoadBalancerSpec {
    pub fn builder(name: &str, region: &str) -> LoadBalancerSpecBuilder {
        LoadBalancerSpecBuilder::new(name, region)
    }

    /// Membership filter: `only` wins over `except`
    pub fn balances(&self, server_name: &str) -> bool {
        if !self.only.is_empty() {
            return self.only.iter().any(|n| n == server_name);
        }
        !self.except.iter().any(|n| n == server_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ValidationError(
                "load balancer name is empty".to_string(),
            ));
        }
        if !constants::AVAILABILITY_ZONES
            .iter()
            .any(|z| z.starts_with(&self.region) && z.len() == self.region.len() + 1)
        {
            return Err(Error::ValidationError(format!(
                "unknown region: {}",
                self.region
            )));
        }
        if self.listeners.is_empty() {
            return Err(Error::ValidationError(format!(
                "load balancer '{}' declares no listeners",
                self.name
            )));
        }
        for policy in &self.sticky_cookies {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Fluent builder for [`LoadBalancerSpec`]
pub struct LoadBalancerSpecBuilder {
    spec: LoadBalancerSpec,
}

impl LoadBalancerSpecBuilder {
    pub fn new(name: &str, region: &str) -> Self {
        Self {
            spec: LoadBalancerSpec {
                name: name.to_string(),
                region: region.to_string(),
                only: Vec::new(),
                except: Vec::new(),
                listeners: default_listeners(),
                sticky_cookies: Vec::new(),
                health_check: HealthCheckConfig::default(),
                dns_alias: None,
            },
        }
    }

    pub fn only(mut self, names: &[&str]) -> Self {
        self.spec.only = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn except(mut self, names: &[&str]) -> Self {
        self.spec.except = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn listeners(mut self, listeners: Vec<Listener>) -> Self {
        self.spec.listeners = listeners;
        self
    }

    pub fn sticky_cookie(mut self, policy: StickyCookiePolicy) -> Self {
        self.spec.sticky_cookies.push(policy);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.spec.health_check = config;
        self
    }

    pub fn dns_alias(mut self, alias: &str) -> Self {
        self.spec.dns_alias = Some(alias.to_string());
        self
    }

    pub fn build(self) -> Result<LoadBalancerSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
