//! Declared server identity and derived live state

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{self, Architecture};
use crate::error::{Error, Result};

/// Instance lifecycle state as reported by the compute control plane
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopped,
    Terminated,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Machine-image reference, possibly one image per architecture class
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageRef {
    pub x86_64: Option<String>,
    pub i686: Option<String>,
}

impl ImageRef {
    pub fn single(image_id: &str) -> Self {
        Self {
            x86_64: Some(image_id.to_string()),
            i686: None,
        }
    }

    /// Image id for an architecture class, falling back to the other class
    /// only when the preferred one is not declared.
    pub fn select(&self, arch: Architecture) -> Result<&str> {
        let preferred = match arch {
            Architecture::X86_64 => self.x86_64.as_deref().or(self.i686.as_deref()),
            Architecture::I686 => self.i686.as_deref().or(self.x86_64.as_deref()),
        };
        preferred.ok_or_else(|| Error::ValidationError("no image id declared".to_string()))
    }
}

/// One declared block device: volume to attach and whether to format it on
/// first attach
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskDevice {
    /// Device name, e.g. `/dev/sdf` (a bare name is prefixed with `/dev/`)
    pub device: String,
    pub volume_id: String,
    #[serde(default)]
    pub format: bool,
}

impl DiskDevice {
    /// Device path with the `/dev/` prefix applied when missing
    pub fn device_path(&self) -> String {
        if self.device.contains('/') {
            self.device.clone()
        } else {
            format!("/dev/{}", self.device)
        }
    }
}

/// Declared identity of one logical server. Immutable once constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub zone: String,
    pub instance_type: String,
    pub image: ImageRef,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Create and attach a per-server security group named after the
    /// qualified server name
    #[serde(default)]
    pub dedicated_security_group: bool,
    #[serde(default)]
    pub disks: Vec<DiskDevice>,
    /// Static IP (or a bare name qualified with the group domain)
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub bootstrap_script: Option<PathBuf>,
    /// Files whose lines become the host's authorized keys
    #[serde(default)]
    pub authorized_key_files: Vec<PathBuf>,
    /// Privileged login user; keys installed for it are copied to root
    #[serde(default)]
    pub sudo_user: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub monitoring: bool,
}

impl ServerSpec {
    pub fn builder(name: &str) -> ServerSpecBuilder {
        ServerSpecBuilder::new(name)
    }

    pub fn region(&self) -> Result<String> {
        constants::zone_to_region(&self.zone)
    }

    /// Architecture-appropriate image id for this server's instance type
    pub fn image_id(&self) -> Result<&str> {
        let arch = Architecture::for_instance_type(&self.instance_type)?;
        self.image.select(arch)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ValidationError("server name is empty".to_string()));
        }
        constants::validate_zone(&self.zone)?;
        constants::validate_instance_type(&self.instance_type)?;
        self.image_id()?;
        for disk in &self.disks {
            if disk.volume_id.is_empty() {
                return Err(Error::ValidationError(format!(
                    "server '{}': disk {} has an empty volume id",
                    self.name, self.device_or_placeholder(disk)
                )));
            }
        }
        Ok(())
    }

    fn device_or_placeholder<'a>(&self, disk: &'a DiskDevice) -> &'a str {
        if disk.device.is_empty() {
            "<unnamed>"
        } else {
            &disk.device
        }
    }
}

/// Fluent builder for [`ServerSpec`]
pub struct ServerSpecBuilder {
    spec: ServerSpec,
}

impl ServerSpecBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            spec: ServerSpec {
                name: name.to_string(),
                zone: String::new(),
                instance_type: String::new(),
                image: ImageRef::default(),
                security_groups: Vec::new(),
                dedicated_security_group: false,
                disks: Vec::new(),
                ip: None,
                bootstrap_script: None,
                authorized_key_files: Vec::new(),
                sudo_user: None,
                user_data: None,
                monitoring: false,
            },
        }
    }

    pub fn zone(mut self, zone: &str) -> Self {
        self.spec.zone = zone.to_string();
        self
    }

    pub fn instance_type(mut self, instance_type: &str) -> Self {
        self.spec.instance_type = instance_type.to_string();
        self
    }

    pub fn image(mut self, image: ImageRef) -> Self {
        self.spec.image = image;
        self
    }

    pub fn image_id(mut self, image_id: &str) -> Self {
        self.spec.image = ImageRef::single(image_id);
        self
    }

    pub fn security_group(mut self, group: &str) -> Self {
        self.spec.security_groups.push(group.to_string());
        self
    }

    pub fn dedicated_security_group(mut self) -> Self {
        self.spec.dedicated_security_group = true;
        self
    }

    pub fn disk(mut self, device: &str, volume_id: &str, format: bool) -> Self {
        self.spec.disks.push(DiskDevice {
            device: device.to_string(),
            volume_id: volume_id.to_string(),
            format,
        });
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.spec.ip = Some(ip.to_string());
        self
    }

    pub fn bootstrap_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.bootstrap_script = Some(path.into());
        self
    }

    pub fn authorized_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.authorized_key_files.push(path.into());
        self
    }

    pub fn sudo_user(mut self, user: &str) -> Self {
        self.spec.sudo_user = Some(user.to_string());
        self
    }

    pub fn user_data(mut self, data: &str) -> Self {
        self.spec.user_data = Some(data.to_string());
        self
    }

    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.spec.monitoring = enabled;
        self
    }

    pub fn build(self) -> Result<ServerSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Live state derived from the compute control plane, cached per poll and
/// never persisted across runs
#[derive(Clone, Debug, Default)]
pub struct LiveServerState {
    /// Absent means not running
    pub instance_id: Option<String>,
    pub dns_name: Option<String>,
    pub state: InstanceState,
    pub launch_time: Option<DateTime<Utc>>,
}
