//! Local trust store
//!
//! An append-only line-oriented known-hosts file. Entries for a host are
//! always purged before new ones are appended, and the purge-then-append
//! window is serialized per hostname so concurrent trust establishment for
//! different hosts stays safe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::Result;

pub struct KnownHostsStore {
    path: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KnownHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Hold this guard across a purge-then-append sequence for `host`
    pub async fn lock_host(&self, host: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(host.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Remove every entry whose host field matches one of `hosts`
    pub async fn remove(&self, hosts: &[&str]) -> Result<()> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| !Self::line_matches(line, hosts))
            .collect();

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        tokio::fs::write(&self.path, rewritten).await?;
        debug!("purged trust-store entries for {hosts:?}");
        Ok(())
    }

    /// Append raw key-scan lines to the store
    pub async fn append(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        for line in lines {
            contents.push_str(line.trim_end());
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }

    /// The host field is the first token, possibly a comma-separated list
    fn line_matches(line: &str, hosts: &[&str]) -> bool {
        let Some(field) = line.split_whitespace().next() else {
            return false;
        };
        field
            .split(',')
            .any(|entry| hosts.iter().any(|host| entry == *host))
    }
}
