//! Compute control-plane client

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Credentials;
use crate::error::Result;
use crate::spec::InstanceState;

use super::check_response;

/// Parameters for launching one instance
#[derive(Clone, Debug, Serialize)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub zone: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub monitoring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
    pub zone: String,
    pub instance_type: String,
    #[serde(default)]
    pub monitoring: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub status: String,
    #[serde(default)]
    pub attached_instance_id: Option<String>,
}

impl VolumeDescription {
    pub fn in_use(&self) -> bool {
        self.status == "in-use"
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyPairMaterial {
    pub name: String,
    pub private_key: String,
}

/// Compute-provider operations used by the reconcilers
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String>;

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription>;

    /// Instance tagged with `name` in state pending or running, if any
    async fn find_instance_by_tag(&self, name: &str) -> Result<Option<InstanceDescription>>;

    async fn tag_instance(&self, instance_id: &str, name: &str) -> Result<()>;

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    async fn associate_address(&self, instance_id: &str, ip: &str) -> Result<()>;

    async fn set_monitoring(&self, instance_id: &str, enabled: bool) -> Result<()>;

    async fn console_output(&self, instance_id: &str) -> Result<String>;

    async fn create_key_pair(&self, name: &str) -> Result<KeyPairMaterial>;

    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription>;

    async fn create_security_group_if_missing(&self, name: &str, description: &str) -> Result<()>;
}

/// HTTP implementation against a regional compute endpoint
pub struct HttpComputeClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpComputeClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .basic_auth(
                &self.credentials.access_key_id,
                Some(&self.credentials.secret_access_key),
            )
    }
}

#[derive(Deserialize)]
struct LaunchResponse {
    instance_id: String,
}

#[derive(Deserialize)]
struct ConsoleResponse {
    #[serde(default)]
    output: String,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceDescription>,
}

#[async_trait]
impl ComputeApi for HttpComputeClient {
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String> {
        debug!(
            "launching instance: image={} type={} zone={}",
            request.image_id, request.instance_type, request.zone
        );
        let response = self
            .request(reqwest::Method::POST, "/instances")
            .json(request)
            .send()
            .await?;
        let launched: LaunchResponse = check_response("launch_instance", response)
            .await?
            .json()
            .await?;
        Ok(launched.instance_id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription> {
        let response = self
            .request(reqwest::Method::GET, &format!("/instances/{instance_id}"))
            .send()
            .await?;
        Ok(check_response("describe_instance", response)
            .await?
            .json()
            .await?)
    }

    async fn find_instance_by_tag(&self, name: &str) -> Result<Option<InstanceDescription>> {
        let response = self
            .request(reqwest::Method::GET, "/instances")
            .query(&[("tag", name), ("state", "pending,running")])
            .send()
            .await?;
        let list: InstanceList = check_response("find_instance_by_tag", response)
            .await?
            .json()
            .await?;
        Ok(list.instances.into_iter().next())
    }

    async fn tag_instance(&self, instance_id: &str, name: &str) -> Result<()> {
        debug!("tagging instance {instance_id} as {name}");
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/instances/{instance_id}/tags"),
            )
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        check_response("tag_instance", response).await?;
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        debug!("attaching {volume_id} to {instance_id} as {device}");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/volumes/{volume_id}/attach"),
            )
            .json(&serde_json::json!({
                "instance_id": instance_id,
                "device": device,
            }))
            .send()
            .await?;
        check_response("attach_volume", response).await?;
        Ok(())
    }

    async fn associate_address(&self, instance_id: &str, ip: &str) -> Result<()> {
        debug!("associating address {ip} with {instance_id}");
        let response = self
            .request(reqwest::Method::POST, "/addresses/associate")
            .json(&serde_json::json!({
                "instance_id": instance_id,
                "ip": ip,
            }))
            .send()
            .await?;
        check_response("associate_address", response).await?;
        Ok(())
    }

    async fn set_monitoring(&self, instance_id: &str, enabled: bool) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/instances/{instance_id}/monitoring"),
            )
            .json(&serde_json::json!({ "enabled": enabled }))
            .send()
            .await?;
        check_response("set_monitoring", response).await?;
        Ok(())
    }

    async fn console_output(&self, instance_id: &str) -> Result<String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/instances/{instance_id}/console"),
            )
            .send()
            .await?;
        let console: ConsoleResponse = check_response("console_output", response)
            .await?
            .json()
            .await?;
        Ok(console.output)
    }

    async fn create_key_pair(&self, name: &str) -> Result<KeyPairMaterial> {
        debug!("creating key pair {name}");
        let response = self
            .request(reqwest::Method::POST, "/key-pairs")
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Ok(check_response("create_key_pair", response)
            .await?
            .json()
            .await?)
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        debug!("deleting key pair {name}");
        let response = self
            .request(reqwest::Method::DELETE, &format!("/key-pairs/{name}"))
            .send()
            .await?;
        check_response("delete_key_pair", response).await?;
        Ok(())
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription> {
        let response = self
            .request(reqwest::Method::GET, &format!("/volumes/{volume_id}"))
            .send()
            .await?;
        Ok(check_response("describe_volume", response)
            .await?
            .json()
            .await?)
    }

    async fn create_security_group_if_missing(&self, name: &str, description: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, &format!("/security-groups/{name}"))
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            check_response("describe_security_group", response).await?;
            return Ok(());
        }
        debug!("creating security group {name}");
        let response = self
            .request(reqwest::Method::POST, "/security-groups")
            .json(&serde_json::json!({
                "name": name,
                "description": description,
            }))
            .send()
            .await?;
        check_response("create_security_group", response).await?;
        Ok(())
    }
}
