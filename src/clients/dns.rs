//! Hosted-zone/DNS control-plane client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Credentials;
use crate::error::Result;

use super::check_response;

/// Alias destination: a DNS name inside a provider-managed hosted zone
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTarget {
    pub dns_name: String,
    pub hosted_zone_id: String,
}

/// Hosted-zone operations used by the load-balancer reconciler
#[async_trait]
pub trait DnsApi: Send + Sync {
    async fn zone_exists(&self, domain: &str) -> Result<bool>;

    async fn create_zone(&self, domain: &str) -> Result<()>;

    /// Current alias target for `domain`, if an alias record exists
    async fn alias_target(&self, domain: &str) -> Result<Option<AliasTarget>>;

    async fn add_alias_record(&self, domain: &str, target: &AliasTarget) -> Result<()>;

    async fn remove_alias_records(&self, domain: &str) -> Result<()>;
}

/// Zone and record names are normalized with a trailing dot
fn with_final_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// HTTP implementation against the global DNS endpoint
pub struct HttpDnsClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpDnsClient {
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
}

#[derive(Deserialize)]
struct AliasResponse {
    #[serde(default)]
    alias_target: Option<AliasTarget>,
}

#[async_trait]
impl DnsApi for HttpDnsClient {
    async fn zone_exists(&self, domain: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/zones/{}", with_final_dot(domain)),
            )
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        check_response("describe_zone", response).await?;
        Ok(true)
    }

    async fn create_zone(&self, domain: &str) -> Result<()> {
        debug!("creating hosted zone {domain}");
        let response = self
            .request(reqwest::Method::POST, "/zones")
            .json(&serde_json::json!({ "name": with_final_dot(domain) }))
            .send()
            .await?;
        check_response("create_zone", response).await?;
        Ok(())
    }

    async fn alias_target(&self, domain: &str) -> Result<Option<AliasTarget>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/records/{}/alias", with_final_dot(domain)),
            )
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let alias: AliasResponse = check_response("get_alias_target", response)
            .await?
            .json()
            .await?;
        Ok(alias.alias_target)
    }

    async fn add_alias_record(&self, domain: &str, target: &AliasTarget) -> Result<()> {
        debug!("adding alias {domain} -> {}", target.dns_name);
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/records/{}/alias", with_final_dot(domain)),
            )
            .json(target)
            .send()
            .await?;
        check_response("add_alias_record", response).await?;
        Ok(())
    }

    async fn remove_alias_records(&self, domain: &str) -> Result<()> {
        debug!("removing alias records for {domain}");
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/records/{}/alias", with_final_dot(domain)),
            )
            .send()
            .await?;
        check_response("remove_alias_records", response).await?;
        Ok(())
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

    #[test]
    fn test_with_final_dot() {
        assert_eq!(with_final_dot("example.org"), "example.org.");
        assert_eq!(with_final_dot("example.org."), "example.org.");
    }

    #[tokio::test]
    async fn test_zone_exists_false_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones/example.org."))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpDnsClient::new(&server.uri(), credentials());
        assert!(!client.zone_exists("example.org").await.unwrap());
    }

    #[tokio::test]
    async fn test_alias_target_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/www.example.org./alias"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "alias_target": {
                        "dns_name": "front-123.elb.example.net",
                        "hosted_zone_id": "Z123"
                    }
                })),
            )
            .mount(&server)
            .await;

        let client = HttpDnsClient::new(&server.uri(), credentials());
        let target = client.alias_target("www.example.org").await.unwrap();
        assert_eq!(
            target,
            Some(AliasTarget {
                dns_name: "front-123.elb.example.net".to_string(),
                hosted_zone_id: "Z123".to_string(),
            })
        );
    }
}
