//! Per-server reconciliation
//!
//! A server is identified by its qualified instance tag and by the volumes
//! it owns. `running_state` consults both; `start` runs the strictly
//! ordered first-boot sequence; `refresh` re-applies declared settings to
//! an instance that is already up.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clients::{ComputeApi, InstanceDescription, LaunchRequest};
use crate::error::{Error, Result};
use crate::spec::{InstanceState, ServerSpec};
use crate::ssh::{is_ip_literal, Resolver, SshRunner, SshTarget};
use crate::trust::TrustEstablisher;
use crate::wait::wait_until;

use super::TemporaryKeyPair;

/// Interval between boot-completion polls; boot has no hard deadline
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct ServerReconciler {
    tag: String,
    spec: ServerSpec,
    compute: Arc<dyn ComputeApi>,
    ssh: Arc<dyn SshRunner>,
    trust: Arc<TrustEstablisher>,
    resolver: Arc<dyn Resolver>,
}

impl ServerReconciler {
    pub fn new(
        tag: String,
        spec: ServerSpec,
        compute: Arc<dyn ComputeApi>,
        ssh: Arc<dyn SshRunner>,
        trust: Arc<TrustEstablisher>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            tag,
            spec,
            compute,
            ssh,
            trust,
            resolver,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Instance id of the running instance, if any.
    ///
    /// Two independent lookups must agree: the instance carrying this
    /// server's tag, and the instance the declared volumes are attached to.
    /// A disagreement is configuration drift and aborts the whole run
    /// rather than letting one lookup silently win.
    pub async fn running_state(&self) -> Result<Option<String>> {
        let tagged = self
            .compute
            .find_instance_by_tag(&self.tag)
            .await?
            .map(|desc| desc.instance_id);

        let mut attached: Vec<String> = Vec::new();
        for disk in &self.spec.disks {
            let volume = self.compute.describe_volume(&disk.volume_id).await?;
            if volume.in_use() {
                if let Some(id) = volume.attached_instance_id {
                    if !attached.contains(&id) {
                        attached.push(id);
                    }
                }
            }
        }
        if attached.len() > 1 {
            return Err(Error::ServerStateConflict {
                server: self.spec.name.clone(),
                tagged,
                attached: Some(attached.join(", ")),
            });
        }

        match (tagged, attached.into_iter().next()) {
            (Some(tagged), Some(attached)) if tagged != attached => {
                Err(Error::ServerStateConflict {
                    server: self.spec.name.clone(),
                    tagged: Some(tagged),
                    attached: Some(attached),
                })
            }
            (Some(id), _) | (None, Some(id)) => Ok(Some(id)),
            (None, None) => Ok(None),
        }
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.running_state().await?.is_some())
    }

    /// Launch the instance and run the first-boot sequence.
    ///
    /// The order is deliberate: trust is established before any SSH step,
    /// keys are installed before the temporary key pair goes away, the
    /// static address is associated (and trust re-established for it)
    /// before bootstrap, and disks are attached last so a bootstrap failure
    /// never leaves half-attached volumes.
    pub async fn start(&self, key_pair: &TemporaryKeyPair) -> Result<String> {
        info!("starting server {} in {}", self.spec.name, self.spec.zone);

        let mut security_groups = self.spec.security_groups.clone();
        if self.spec.dedicated_security_group {
            self.compute
                .create_security_group_if_missing(
                    &self.tag,
                    &format!("dedicated group for {}", self.tag),
                )
                .await?;
            security_groups.push(self.tag.clone());
        }

        let request = LaunchRequest {
            image_id: self.spec.image_id()?.to_string(),
            instance_type: self.spec.instance_type.clone(),
            zone: self.spec.zone.clone(),
            key_name: key_pair.name.clone(),
            security_groups,
            monitoring: self.spec.monitoring,
            user_data: self.spec.user_data.clone(),
        };
        let instance_id = self.compute.launch_instance(&request).await?;
        self.compute.tag_instance(&instance_id, &self.tag).await?;

        let description = self.wait_until_running(&instance_id).await?;
        let dns_name = description
            .dns_name
            .ok_or_else(|| Error::MissingDnsName(instance_id.clone()))?;

        self.trust.establish(&instance_id, &dns_name).await?;
        self.install_authorized_keys(&dns_name, Some(&key_pair.key_path))
            .await?;

        // Association changes the effective login endpoint; trust must be
        // re-established for it before any further SSH step.
        let endpoint = if let Some(ip) = &self.spec.ip {
            self.associate_address(&instance_id, ip).await?;
            self.trust.establish(&instance_id, ip).await?;
            ip.clone()
        } else {
            dns_name
        };

        if let Some(script) = &self.spec.bootstrap_script {
            self.run_bootstrap(&endpoint, script).await?;
        }

        self.attach_disks(&instance_id, &endpoint).await?;

        info!("server {} started as {instance_id}", self.spec.name);
        Ok(instance_id)
    }

    /// Re-apply declared settings to an already running instance.
    ///
    /// Trust failures are demoted to warnings here: a host key may have
    /// rotated legitimately and a refresh must not take a healthy server
    /// out of the run over it. Everything else propagates.
    pub async fn refresh(&self, instance_id: &str) -> Result<()> {
        info!("refreshing server {} ({instance_id})", self.spec.name);
        let description = self.compute.describe_instance(instance_id).await?;

        if description.monitoring != self.spec.monitoring {
            self.compute
                .set_monitoring(instance_id, self.spec.monitoring)
                .await?;
        }

        // Idempotent on the provider side when already associated
        if let Some(ip) = &self.spec.ip {
            self.associate_address(instance_id, ip).await?;
        }

        let endpoint = match (&self.spec.ip, &description.dns_name) {
            (Some(ip), _) => ip.clone(),
            (None, Some(dns)) => dns.clone(),
            (None, None) => {
                warn!(
                    "{}: no login endpoint reported, skipping key refresh",
                    self.spec.name
                );
                return Ok(());
            }
        };

        match self.trust.establish(instance_id, &endpoint).await {
            Ok(()) => self.install_authorized_keys(&endpoint, None).await?,
            Err(e) if e.is_trust_failure() => {
                warn!(
                    "{}: trust not re-established, skipping key refresh: {e}",
                    self.spec.name
                );
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn wait_until_running(&self, instance_id: &str) -> Result<InstanceDescription> {
        wait_until(
            &format!("instance {instance_id} to run"),
            BOOT_POLL_INTERVAL,
            None,
            move || async move {
                let desc = self.compute.describe_instance(instance_id).await?;
                Ok((desc.state == InstanceState::Running).then_some(desc))
            },
        )
        .await
    }

    /// Concatenate the declared key files into the remote authorized_keys.
    /// With a sudo user the keys land in its home first and are copied to
    /// root's.
    async fn install_authorized_keys(&self, host: &str, identity: Option<&Path>) -> Result<()> {
        if self.spec.authorized_key_files.is_empty() {
            debug!("no authorized key files declared for {}", self.spec.name);
            return Ok(());
        }
        let mut keys = String::new();
        for file in &self.spec.authorized_key_files {
            let contents = tokio::fs::read_to_string(file).await?;
            keys.push_str(contents.trim_end());
            keys.push('\n');
        }

        let user = self.spec.sudo_user.as_deref().unwrap_or("root");
        let mut target = SshTarget::new(user, host);
        if let Some(identity) = identity {
            target = target.with_identity(identity);
        }
        self.ssh
            .run(&target, "mkdir -p .ssh && chmod 700 .ssh")
            .await?;
        self.ssh
            .write_remote_file(&target, ".ssh/authorized_keys", &keys)
            .await?;
        if self.spec.sudo_user.is_some() {
            self.ssh
                .run(
                    &target,
                    "sudo mkdir -p /root/.ssh && \
                     sudo cp .ssh/authorized_keys /root/.ssh/authorized_keys",
                )
                .await?;
        }
        info!("installed authorized keys on {host}");
        Ok(())
    }

    async fn associate_address(&self, instance_id: &str, ip: &str) -> Result<()> {
        let address = if is_ip_literal(ip) {
            ip.to_string()
        } else {
            self.resolver.resolve(ip).await?.to_string()
        };
        info!("associating {address} ({ip}) with {instance_id}");
        self.compute.associate_address(instance_id, &address).await
    }

    async fn run_bootstrap(&self, host: &str, script: &Path) -> Result<()> {
        let basename = script
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "bootstrap script has no file name: {}",
                    script.display()
                ))
            })?;
        info!("running bootstrap script {basename} on {host}");
        let target = SshTarget::new("root", host);
        self.ssh.copy(&target, script, "/tmp").await?;
        self.ssh
            .run(
                &target,
                &format!("cd /tmp && chmod 700 {basename} && ./{basename} && rm {basename}"),
            )
            .await?;
        Ok(())
    }

    /// Devices marked for formatting get their mkfs issued before the
    /// volume attach is requested.
    async fn attach_disks(&self, instance_id: &str, host: &str) -> Result<()> {
        let target = SshTarget::new("root", host);
        for disk in &self.spec.disks {
            let device = disk.device_path();
            if disk.format {
                info!("formatting {device} on {host}");
                self.ssh
                    .run(&target, &format!("mkfs.ext4 -q {device}"))
                    .await?;
            }
            self.compute
                .attach_volume(&disk.volume_id, instance_id, &device)
                .await?;
        }
        Ok(())
    }
}
