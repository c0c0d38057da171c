//! SSH transport seam
//!
//! Remote commands, file copies and live host-key scans go through traits
//! so the reconcilers can be tested without a network. The default
//! implementations drive the OpenSSH client tools as subprocesses, pinned
//! to the crate's trust store.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

pub mod fingerprint;
mod known_hosts;

pub use known_hosts::KnownHostsStore;

/// One SSH login endpoint
#[derive(Clone, Debug)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    /// Identity file, e.g. a temporary key-pair's private key
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// Remote execution over an established trust relationship
#[async_trait]
pub trait SshRunner: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<()>;

    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<()>;

    /// Stream `contents` into a remote file (`cat > path`)
    async fn write_remote_file(&self, target: &SshTarget, remote: &str, contents: &str)
        -> Result<()>;
}

/// Active host-key scanning, independent of the console channel
#[async_trait]
pub trait KeyScanner: Send + Sync {
    /// Raw RSA keyscan line for `host`, or `None` when the scan produced
    /// nothing (daemon not up yet, unreachable host)
    async fn scan_rsa(&self, host: &str) -> Result<Option<String>>;
}

/// Forward DNS resolution, separated out so trust tests can pin addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<std::net::IpAddr>;
}

/// OpenSSH subprocess implementation of [`SshRunner`]
pub struct OpenSshRunner {
    known_hosts: PathBuf,
}

impl OpenSshRunner {
    pub fn new(known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            known_hosts: known_hosts.into(),
        }
    }

    fn command(&self, target: &SshTarget) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .arg("-o")
            .arg("StrictHostKeyChecking=yes")
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(identity) = &target.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", target.user, target.host));
        cmd
    }

    async fn finish(target: &SshTarget, output: std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        Err(Error::RemoteCommandError {
            host: target.host.clone(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl SshRunner for OpenSshRunner {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<()> {
        debug!("ssh {}@{}: {command}", target.user, target.host);
        let output = self
            .command(target)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Self::finish(target, output).await
    }

    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<()> {
        debug!(
            "scp {} -> {}@{}:{remote}",
            local.display(),
            target.user,
            target.host
        );
        let mut cmd = Command::new("scp");
        cmd.arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .arg("-o")
            .arg("StrictHostKeyChecking=yes");
        if let Some(identity) = &target.identity {
            cmd.arg("-i").arg(identity);
        }
        let output = cmd
            .arg(local)
            .arg(format!("{}@{}:{remote}", target.user, target.host))
            .output()
            .await?;
        Self::finish(target, output).await
    }

    async fn write_remote_file(
        &self,
        target: &SshTarget,
        remote: &str,
        contents: &str,
    ) -> Result<()> {
        debug!("writing {remote} on {}@{}", target.user, target.host);
        let mut child = self
            .command(target)
            .arg(format!("cat > {remote}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::RemoteCommandError {
            host: target.host.clone(),
            detail: "could not open ssh stdin".to_string(),
        })?;
        stdin.write_all(contents.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        Self::finish(target, output).await
    }
}

/// `ssh-keyscan` subprocess implementation of [`KeyScanner`]
pub struct OpenSshKeyScanner {
    timeout_secs: u32,
}

impl OpenSshKeyScanner {
    pub fn new() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Default for OpenSshKeyScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyScanner for OpenSshKeyScanner {
    async fn scan_rsa(&self, host: &str) -> Result<Option<String>> {
        let output = Command::new("ssh-keyscan")
            .arg("-t")
            .arg("rsa")
            .arg("-T")
            .arg(self.timeout_secs.to_string())
            .arg(host)
            .stderr(Stdio::null())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .map(str::to_string);
        Ok(line)
    }
}

/// System resolver via tokio's host lookup
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<std::net::IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 22))
            .await
            .map_err(|_| Error::ResolveError(host.to_string()))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| Error::ResolveError(host.to_string()))
    }
}

/// True when `address` is already a literal IP
pub fn is_ip_literal(address: &str) -> bool {
    address.parse::<std::net::IpAddr>().is_ok()
}
