//! SSH trust establishment
//!
//! Before any SSH-based step touches a freshly booted host, its RSA host-key
//! fingerprint is obtained from three independent channels: the provider's
//! serial console, a live key scan by name, and a live key scan by resolved
//! IP. The host is admitted into the trust store only if all three agree.
//! An attacker who controls DNS can redirect the name scan, and one who
//! controls the network path can redirect the IP scan, but neither can
//! rewrite the provider's console channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clients::ComputeApi;
use crate::error::{Error, Result};
use crate::retry::{exponential_backoff, retry_with_backoff};
use crate::ssh::fingerprint::{console_rsa_fingerprint, keyscan_line_fingerprint};
use crate::ssh::{KeyScanner, KnownHostsStore, Resolver};
use crate::wait::wait_until;

/// Interval between console-output polls
pub const CONSOLE_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Ceiling on the console-fingerprint wait; console output that never
/// contains a fingerprint is a genuine failure, not slowness
pub const CONSOLE_WAIT_CEILING: Duration = Duration::from_secs(420);
/// Total verification attempts before a mismatch is treated as real
pub const MAX_ATTEMPTS: u32 = 8;
/// Backoff cap between attempts, in seconds
pub const BACKOFF_CAP_SECS: u64 = 30;

pub struct TrustEstablisher {
    compute: Arc<dyn ComputeApi>,
    scanner: Arc<dyn KeyScanner>,
    resolver: Arc<dyn Resolver>,
    store: Arc<KnownHostsStore>,
}

impl TrustEstablisher {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        scanner: Arc<dyn KeyScanner>,
        resolver: Arc<dyn Resolver>,
        store: Arc<KnownHostsStore>,
    ) -> Self {
        Self {
            compute,
            scanner,
            resolver,
            store,
        }
    }

    /// Produce a verified trust-store entry for `hostname`.
    ///
    /// Transient mismatches right after boot (stale DNS, sshd still
    /// starting) are expected and retried under bounded exponential
    /// backoff; a mismatch that survives every attempt propagates as
    /// [`Error::SecurityError`].
    pub async fn establish(&self, instance_id: &str, hostname: &str) -> Result<()> {
        info!("establishing trust for {hostname} (instance {instance_id})");
        retry_with_backoff(
            &format!("host key verification for {hostname}"),
            MAX_ATTEMPTS,
            exponential_backoff(BACKOFF_CAP_SECS),
            |e| matches!(e, Error::SecurityError { .. }),
            || self.verify_and_admit(instance_id, hostname),
        )
        .await
    }

    async fn verify_and_admit(&self, instance_id: &str, hostname: &str) -> Result<()> {
        let console_fp = self.console_fingerprint(instance_id).await?;
        debug!("console fingerprint for {instance_id}: {console_fp}");

        let ip = self.resolver.resolve(hostname).await?.to_string();

        // Serialize purge-then-append per hostname; stale entries must not
        // mask a mismatch.
        let _guard = self.store.lock_host(hostname).await;
        self.store.remove(&[hostname, ip.as_str()]).await?;

        let name_line = self.scanner.scan_rsa(hostname).await?;
        let ip_line = self.scanner.scan_rsa(&ip).await?;

        let name_fp = name_line.as_deref().and_then(keyscan_line_fingerprint);
        let ip_fp = ip_line.as_deref().and_then(keyscan_line_fingerprint);

        let all_agree = match (&name_fp, &ip_fp) {
            (Some(name), Some(ip_fp)) => *name == console_fp && *ip_fp == console_fp,
            _ => false,
        };
        if !all_agree {
            return Err(Error::SecurityError {
                host: hostname.to_string(),
                console: Some(console_fp),
                name_scan: name_fp,
                ip_scan: ip_fp,
            });
        }

        self.store
            .append(&[name_line.unwrap_or_default(), ip_line.unwrap_or_default()])
            .await?;
        info!("trust established for {hostname} ({ip})");
        Ok(())
    }

    /// Poll the serial console until it contains an RSA fingerprint
    async fn console_fingerprint(&self, instance_id: &str) -> Result<String> {
        let result = wait_until(
            &format!("console fingerprint of {instance_id}"),
            CONSOLE_POLL_INTERVAL,
            Some(CONSOLE_WAIT_CEILING),
            move || async move {
                let console = self.compute.console_output(instance_id).await?;
                Ok(console_rsa_fingerprint(&console))
            },
        )
        .await;

        match result {
            Err(Error::WaitTimeout { waited_secs, .. }) => Err(Error::FingerprintUnavailable {
                instance: instance_id.to_string(),
                waited_secs,
            }),
            other => other,
        }
    }
}
