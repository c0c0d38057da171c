//! Fleet groups: a named set of servers and load balancers managed as a unit

use serde::Deserialize;

use crate::error::{Error, Result};

use super::load_balancer::LoadBalancerSpec;
use super::server::ServerSpec;

/// A named collection of declared servers and load balancers
#[derive(Clone, Debug)]
pub struct FleetGroup {
    pub name: String,
    /// Appended to bare (dot-free) static IP names and DNS aliases
    pub domain: Option<String>,
    pub servers: Vec<ServerSpec>,
    pub load_balancers: Vec<LoadBalancerSpec>,
}

impl FleetGroup {
    pub fn builder(name: &str) -> FleetGroupBuilder {
        FleetGroupBuilder::new(name)
    }

    /// Parse a TOML fleet file
    pub fn from_toml(raw: &str) -> Result<FleetGroup> {
        let file: FleetFile = toml::from_str(raw)
            .map_err(|e| Error::ConfigError(format!("invalid fleet file: {e}")))?;
        let mut builder = FleetGroupBuilder::new(&file.name);
        if let Some(domain) = &file.domain {
            builder = builder.domain(domain);
        }
        for server in file.servers {
            builder = builder.server(server);
        }
        for lb in file.load_balancers {
            builder = builder.load_balancer(lb);
        }
        builder.build()
    }

    pub fn server(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Fully-qualified instance tag for a server in this group
    pub fn instance_tag(&self, server: &ServerSpec) -> String {
        format!("{}-{}", self.name, server.name)
    }
}

#[derive(Deserialize)]
struct FleetFile {
    name: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    servers: Vec<ServerSpec>,
    #[serde(default)]
    load_balancers: Vec<LoadBalancerSpec>,
}

pub struct FleetGroupBuilder {
    name: String,
    domain: Option<String>,
    servers: Vec<ServerSpec>,
    load_balancers: Vec<LoadBalancerSpec>,
}

impl FleetGroupBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: None,
            servers: Vec::new(),
            load_balancers: Vec::new(),
        }
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn server(mut self, spec: ServerSpec) -> Self {
        self.servers.push(spec);
        self
    }

    pub fn load_balancer(mut self, spec: LoadBalancerSpec) -> Self {
        self.load_balancers.push(spec);
        self
    }

    pub fn build(self) -> Result<FleetGroup> {
        let mut servers = self.servers;
        let mut load_balancers = self.load_balancers;

        if let Some(domain) = &self.domain {
            for server in &mut servers {
                if let Some(ip) = &server.ip {
                    if !ip.contains('.') {
                        server.ip = Some(format!("{ip}.{domain}"));
                    }
                }
            }
            for lb in &mut load_balancers {
                if let Some(alias) = &lb.dns_alias {
                    if !alias.contains('.') {
                        lb.dns_alias = Some(format!("{alias}.{domain}"));
                    }
                }
            }
        }

        for server in &servers {
            server.validate()?;
        }
        for lb in &load_balancers {
            lb.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for server in &servers {
            if !seen.insert(server.name.as_str()) {
                return Err(Error::ValidationError(format!(
                    "duplicate server name '{}' in group '{}'",
                    server.name, self.name
                )));
            }
        }

        Ok(FleetGroup {
            name: self.name,
            domain: self.domain,
            servers,
            load_balancers,
        })
    }
}
