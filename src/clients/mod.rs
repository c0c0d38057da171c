//! Typed clients for the compute, load-balancer and DNS control planes
//!
//! Each client is a thin wrapper over an HTTP/JSON control plane, exposed
//! through a trait so the reconcilers can be exercised against recording
//! mocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::Response;

use crate::config::FleetConfig;
use crate::error::{Error, Result};

mod compute;
mod dns;
mod load_balancer;

pub use compute::{
    ComputeApi, HttpComputeClient, InstanceDescription, KeyPairMaterial, LaunchRequest,
    VolumeDescription,
};
pub use dns::{AliasTarget, DnsApi, HttpDnsClient};
pub use load_balancer::{
    HttpLoadBalancerClient, InstanceHealth, LoadBalancerApi, LoadBalancerDescription,
};

/// Hands out per-region clients; compute and load-balancer control planes
/// are regional, DNS is global.
pub trait ClientFactory: Send + Sync {
    fn compute(&self, region: &str) -> Arc<dyn ComputeApi>;

    fn load_balancer(&self, region: &str) -> Arc<dyn LoadBalancerApi>;

    fn dns(&self) -> Arc<dyn DnsApi>;
}

/// Production factory: one memoized HTTP client per regional endpoint
pub struct HttpClientFactory {
    config: FleetConfig,
    compute: Mutex<HashMap<String, Arc<dyn ComputeApi>>>,
    load_balancers: Mutex<HashMap<String, Arc<dyn LoadBalancerApi>>>,
    dns: Arc<dyn DnsApi>,
}

impl HttpClientFactory {
    pub fn new(config: FleetConfig) -> Self {
        let dns = Arc::new(HttpDnsClient::new(
            &config.dns_endpoint(),
            config.credentials.clone(),
        ));
        Self {
            config,
            compute: Mutex::new(HashMap::new()),
            load_balancers: Mutex::new(HashMap::new()),
            dns,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn compute(&self, region: &str) -> Arc<dyn ComputeApi> {
        let mut clients = self.compute.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(clients.entry(region.to_string()).or_insert_with(|| {
            Arc::new(HttpComputeClient::new(
                &self.config.compute_endpoint(region),
                self.config.credentials.clone(),
            ))
        }))
    }

    fn load_balancer(&self, region: &str) -> Arc<dyn LoadBalancerApi> {
        let mut clients = self.load_balancers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(clients.entry(region.to_string()).or_insert_with(|| {
            Arc::new(HttpLoadBalancerClient::new(
                &self.config.load_balancer_endpoint(region),
                self.config.credentials.clone(),
            ))
        }))
    }

    fn dns(&self) -> Arc<dyn DnsApi> {
        Arc::clone(&self.dns)
    }
}

/// Map a non-success response to [`Error::ApiError`], keeping the body as
/// the diagnostic message.
pub(crate) async fn check_response(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::ApiError {
        operation: operation.to_string(),
        status: status.as_u16(),
        message,
    })
}
