//! Load-balancer control-plane client

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::Credentials;
use crate::error::Result;
use crate::spec::{HealthCheckConfig, Listener};

use super::check_response;

#[derive(Clone, Debug, Deserialize)]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    /// Hosted-zone id of the balancer's canonical DNS target
    pub canonical_zone_id: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub cookie_policies: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub healthy: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Load-balancer operations used by the reconciler
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// `None` when no balancer with this name exists
    async fn describe(&self, name: &str) -> Result<Option<LoadBalancerDescription>>;

    async fn create(&self, name: &str, zones: &[String], listeners: &[Listener]) -> Result<()>;

    async fn delete_listeners(&self, name: &str, ports: &[u16]) -> Result<()>;

    async fn create_listeners(&self, name: &str, listeners: &[Listener]) -> Result<()>;

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    async fn enable_zones(&self, name: &str, zones: &[String]) -> Result<()>;

    async fn disable_zones(&self, name: &str, zones: &[String]) -> Result<()>;

    /// Remove every cookie policy bound to a listener port
    async fn clear_listener_policies(&self, name: &str, port: u16) -> Result<()>;

    async fn set_lb_cookie_policy(
        &self,
        name: &str,
        ports: &[u16],
        expiration_secs: u64,
    ) -> Result<()>;

    async fn set_app_cookie_policy(
        &self,
        name: &str,
        ports: &[u16],
        cookie_name: &str,
    ) -> Result<()>;

    async fn configure_health_check(&self, name: &str, config: &HealthCheckConfig) -> Result<()>;

    async fn health_status(&self, name: &str) -> Result<Vec<InstanceHealth>>;
}

/// HTTP implementation against a regional load-balancer endpoint
pub struct HttpLoadBalancerClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpLoadBalancerClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .basic_auth(
                &self.credentials.access_key_id,
                Some(&self.credentials.secret_access_key),
            )
    }

    /// Provider-side policy names, derived the same way every run so a
    /// policy is reused rather than duplicated
    fn policy_name(name: &str, suffix: &str) -> String {
        format!("{name}-{suffix}").replace('_', "-")
    }
}

#[derive(Deserialize)]
struct HealthList {
    #[serde(default)]
    instances: Vec<InstanceHealth>,
}

#[async_trait]
impl LoadBalancerApi for HttpLoadBalancerClient {
    async fn describe(&self, name: &str) -> Result<Option<LoadBalancerDescription>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/load-balancers/{name}"))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(
            check_response("describe_load_balancer", response)
                .await?
                .json()
                .await?,
        ))
    }

    async fn create(&self, name: &str, zones: &[String], listeners: &[Listener]) -> Result<()> {
        debug!("creating load balancer {name}");
        let response = self
            .request(reqwest::Method::POST, "/load-balancers")
            .json(&serde_json::json!({
                "name": name,
                "zones": zones,
                "listeners": listeners,
            }))
            .send()
            .await?;
        check_response("create_load_balancer", response).await?;
        Ok(())
    }

    async fn delete_listeners(&self, name: &str, ports: &[u16]) -> Result<()> {
        debug!("deleting listeners {ports:?} on {name}");
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/load-balancers/{name}/listeners"),
            )
            .json(&serde_json::json!({ "ports": ports }))
            .send()
            .await?;
        check_response("delete_listeners", response).await?;
        Ok(())
    }

    async fn create_listeners(&self, name: &str, listeners: &[Listener]) -> Result<()> {
        debug!("creating {} listener(s) on {name}", listeners.len());
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/load-balancers/{name}/listeners"),
            )
            .json(&serde_json::json!({ "listeners": listeners }))
            .send()
            .await?;
        check_response("create_listeners", response).await?;
        Ok(())
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        debug!("registering instances {instance_ids:?} on {name}");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/load-balancers/{name}/instances"),
            )
            .json(&serde_json::json!({ "instance_ids": instance_ids }))
            .send()
            .await?;
        check_response("register_instances", response).await?;
        Ok(())
    }

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        debug!("deregistering instances {instance_ids:?} on {name}");
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/load-balancers/{name}/instances"),
            )
            .json(&serde_json::json!({ "instance_ids": instance_ids }))
            .send()
            .await?;
        check_response("deregister_instances", response).await?;
        Ok(())
    }

    async fn enable_zones(&self, name: &str, zones: &[String]) -> Result<()> {
        debug!("enabling zones {zones:?} on {name}");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/load-balancers/{name}/zones"),
            )
            .json(&serde_json::json!({ "zones": zones }))
            .send()
            .await?;
        check_response("enable_zones", response).await?;
        Ok(())
    }

    async fn disable_zones(&self, name: &str, zones: &[String]) -> Result<()> {
        debug!("disabling zones {zones:?} on {name}");
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/load-balancers/{name}/zones"),
            )
            .json(&serde_json::json!({ "zones": zones }))
            .send()
            .await?;
        check_response("disable_zones", response).await?;
        Ok(())
    }

    async fn clear_listener_policies(&self, name: &str, port: u16) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/load-balancers/{name}/listeners/{port}/policies"),
            )
            .json(&serde_json::json!({ "policies": [] }))
            .send()
            .await?;
        check_response("clear_listener_policies", response).await?;
        Ok(())
    }

    async fn set_lb_cookie_policy(
        &self,
        name: &str,
        ports: &[u16],
        expiration_secs: u64,
    ) -> Result<()> {
        let policy = Self::policy_name(name, &format!("lb-{expiration_secs}"));
        debug!("setting policy {policy} on ports {ports:?} of {name}");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/load-balancers/{name}/policies"),
            )
            .json(&serde_json::json!({
                "policy_name": policy,
                "kind": "lb_cookie",
                "expiration_secs": expiration_secs,
                "ports": ports,
            }))
            .send()
            .await?;
        check_response("set_lb_cookie_policy", response).await?;
        Ok(())
    }

    async fn set_app_cookie_policy(
        &self,
        name: &str,
        ports: &[u16],
        cookie_name: &str,
    ) -> Result<()> {
        let policy = Self::policy_name(name, &format!("app-{cookie_name}"));
        debug!("setting policy {policy} on ports {ports:?} of {name}");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/load-balancers/{name}/policies"),
            )
            .json(&serde_json::json!({
                "policy_name": policy,
                "kind": "app_cookie",
                "cookie_name": cookie_name,
                "ports": ports,
            }))
            .send()
            .await?;
        check_response("set_app_cookie_policy", response).await?;
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, config: &HealthCheckConfig) -> Result<()> {
        debug!("configuring health check on {name}");
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/load-balancers/{name}/health-check"),
            )
            .json(config)
            .send()
            .await?;
        check_response("configure_health_check", response).await?;
        Ok(())
    }

    async fn health_status(&self, name: &str) -> Result<Vec<InstanceHealth>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/load-balancers/{name}/health"),
            )
            .send()
            .await?;
        let list: HealthList = check_response("health_status", response)
            .await?
            .json()
            .await?;
        Ok(list.instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_describe_missing_balancer_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/load-balancers/front"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpLoadBalancerClient::new(&server.uri(), credentials());
        assert!(client.describe("front").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_describe_parses_listeners() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/load-balancers/front"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "name": "front",
                    "dns_name": "front-123.elb.example.net",
                    "canonical_zone_id": "Z123",
                    "instances": ["i-1"],
                    "zones": ["eu-west-1a"],
                    "listeners": [{
                        "protocol": "http",
                        "load_balancer_port": 80,
                        "instance_port": 8080
                    }],
                })),
            )
            .mount(&server)
            .await;

        let client = HttpLoadBalancerClient::new(&server.uri(), credentials());
        let desc = client.describe("front").await.unwrap().unwrap();
        assert_eq!(desc.listeners[0].load_balancer_port, 80);
        assert_eq!(desc.instances, vec!["i-1"]);
    }

    #[test]
    fn test_policy_names_use_dashes() {
        assert_eq!(
            HttpLoadBalancerClient::policy_name("front", "app-my_cookie"),
            "front-app-my-cookie"
        );
    }
}
