//! Error taxonomy for fleet orchestration
//!
//! Per-server failures are isolated by the orchestrator; only
//! [`Error::ServerStateConflict`] aborts a whole run.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Purely local validation failure, raised before any remote call
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A declared spec failed validation
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Transport-level failure talking to a control plane
    #[error("control plane request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Control plane accepted the request but answered with an error status
    #[error("{operation} returned HTTP {status}: {message}")]
    ApiError {
        operation: String,
        status: u16,
        message: String,
    },

    /// Tag-based and volume-based instance lookups disagree.
    ///
    /// The declared disks are attached to a different instance than the one
    /// named by tag. This is configuration drift or a race and is never
    /// auto-resolved.
    #[error(
        "server '{server}' state conflict: tag lookup found {tagged:?}, \
         volume lookup found {attached:?}"
    )]
    ServerStateConflict {
        server: String,
        tagged: Option<String>,
        attached: Option<String>,
    },

    /// The three host-key fingerprint sources did not agree
    #[error(
        "host key verification failed for {host}: \
         console={console:?}, name-scan={name_scan:?}, ip-scan={ip_scan:?}"
    )]
    SecurityError {
        host: String,
        console: Option<String>,
        name_scan: Option<String>,
        ip_scan: Option<String>,
    },

    /// Console output never contained an RSA host-key fingerprint
    #[error("no RSA fingerprint in console output of {instance} after {waited_secs}s")]
    FingerprintUnavailable { instance: String, waited_secs: u64 },

    /// A bounded wait elapsed without its condition becoming true
    #[error("timed out after {waited_secs}s waiting for {what}")]
    WaitTimeout { what: String, waited_secs: u64 },

    /// An SSH/SCP step failed; aborts the affected server's sequence only
    #[error("remote command failed on {host}: {detail}")]
    RemoteCommandError { host: String, detail: String },

    #[error("could not resolve address for {0}")]
    ResolveError(String),

    /// The provider reported a running instance without a DNS name
    #[error("instance {0} has no DNS name")]
    MissingDnsName(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Errors that are expected to self-heal and are worth retrying
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::SecurityError { .. } | Error::HttpError(_))
    }

    /// True for trust-establishment failures that refresh demotes to warnings
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Error::SecurityError { .. } | Error::FingerprintUnavailable { .. }
        )
    }
}
