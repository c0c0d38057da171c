//! Fleet-level orchestration
//!
//! One run: partition the group's servers into running and missing,
//! refresh the running ones, start the missing ones under a shared
//! temporary key pair, then reconcile every declared load balancer against
//! the servers that completed their sequence. A failed server is reported
//! and excluded from balancing; it never aborts its siblings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::clients::{ClientFactory, ComputeApi, InstanceHealth};
use crate::error::{Error, Result};
use crate::spec::{FleetGroup, LiveServerState, ServerSpec};
use crate::ssh::{KeyScanner, KnownHostsStore, Resolver, SshRunner};
use crate::trust::TrustEstablisher;

use super::load_balancer::{LoadBalancerReconciler, MemberServer};
use super::server::ServerReconciler;
use super::TemporaryKeyPair;

/// What the orchestrator did with one server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerAction {
    Started,
    Refreshed,
    /// The running-state probe itself failed; the server was not touched
    Probed,
}

impl std::fmt::Display for ServerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerAction::Started => "started",
            ServerAction::Refreshed => "refreshed",
            ServerAction::Probed => "probed",
        };
        write!(f, "{s}")
    }
}

/// Per-server result of one run
#[derive(Debug)]
pub struct ServerOutcome {
    pub name: String,
    pub zone: String,
    pub action: ServerAction,
    /// Instance id on success
    pub result: Result<String>,
}

/// Per-balancer result of one run
#[derive(Debug)]
pub struct BalancerOutcome {
    pub name: String,
    pub result: Result<()>,
}

#[derive(Debug)]
pub struct LaunchReport {
    pub outcomes: Vec<ServerOutcome>,
    pub balancers: Vec<BalancerOutcome>,
}

impl LaunchReport {
    /// Servers that completed their sequence, with their instance ids
    pub fn succeeded(&self) -> impl Iterator<Item = (&ServerOutcome, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|id| (o, id.as_str())))
    }

    pub fn failed(&self) -> impl Iterator<Item = &ServerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn failed_balancers(&self) -> impl Iterator<Item = &BalancerOutcome> {
        self.balancers.iter().filter(|b| b.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
            && self.balancers.iter().all(|b| b.result.is_ok())
    }
}

/// Current state of one declared server, for status reporting
#[derive(Debug)]
pub struct ServerStatus {
    pub name: String,
    pub zone: String,
    pub live: LiveServerState,
}

/// Live membership health of one declared load balancer
#[derive(Debug)]
pub struct BalancerStatus {
    pub name: String,
    /// Empty when the balancer does not exist yet
    pub members: Vec<InstanceHealth>,
}

/// The shared key pair of one launch batch, registered per region
struct BatchKeys {
    by_region: HashMap<String, TemporaryKeyPair>,
}

pub struct FleetOrchestrator {
    group: FleetGroup,
    clients: Arc<dyn ClientFactory>,
    ssh: Arc<dyn SshRunner>,
    scanner: Arc<dyn KeyScanner>,
    resolver: Arc<dyn Resolver>,
    store: Arc<KnownHostsStore>,
    temp_dir: PathBuf,
}

impl FleetOrchestrator {
    pub fn new(
        group: FleetGroup,
        clients: Arc<dyn ClientFactory>,
        ssh: Arc<dyn SshRunner>,
        scanner: Arc<dyn KeyScanner>,
        resolver: Arc<dyn Resolver>,
        store: Arc<KnownHostsStore>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            group,
            clients,
            ssh,
            scanner,
            resolver,
            store,
            temp_dir,
        }
    }

    /// One full run over the requested servers (all of them when the list
    /// is empty), followed by load-balancer reconciliation.
    pub async fn launch(&self, requested: &[String]) -> Result<LaunchReport> {
        let selected = self.select_servers(requested)?;
        info!(
            "launching group '{}' ({} servers)",
            self.group.name,
            selected.len()
        );

        // Partition into running and missing; a state conflict aborts the
        // run before anything is touched.
        let probes = join_all(selected.iter().map(|spec| async move {
            let state = async { self.reconciler_for(spec)?.running_state().await }.await;
            (*spec, state)
        }))
        .await;

        let mut outcomes = Vec::new();
        let mut running: Vec<(&ServerSpec, String)> = Vec::new();
        let mut missing: Vec<&ServerSpec> = Vec::new();
        for (spec, probe) in probes {
            match probe {
                Ok(Some(instance_id)) => running.push((spec, instance_id)),
                Ok(None) => missing.push(spec),
                // Conflicting live state is configuration drift; nothing
                // may be touched until an operator resolves it.
                Err(e @ Error::ServerStateConflict { .. }) => return Err(e),
                Err(e) => {
                    error!("server {} failed its running-state probe: {e}", spec.name);
                    outcomes.push(ServerOutcome {
                        name: spec.name.clone(),
                        zone: spec.zone.clone(),
                        action: ServerAction::Probed,
                        result: Err(e),
                    });
                }
            }
        }
        info!("{} running, {} missing", running.len(), missing.len());

        let refreshed = join_all(running.into_iter().map(|(spec, instance_id)| async move {
            let result = async {
                self.reconciler_for(spec)?.refresh(&instance_id).await?;
                Ok::<_, Error>(instance_id.clone())
            }
            .await;
            if let Err(e) = &result {
                error!("server {} failed to refresh: {e}", spec.name);
            }
            ServerOutcome {
                name: spec.name.clone(),
                zone: spec.zone.clone(),
                action: ServerAction::Refreshed,
                result,
            }
        }))
        .await;
        outcomes.extend(refreshed);

        if !missing.is_empty() {
            let keys = self.create_batch_keys(&missing).await?;
            for spec in &missing {
                let result = self.start_one(spec, &keys).await;
                if let Err(e) = &result {
                    error!("server {} failed to start: {e}", spec.name);
                }
                outcomes.push(ServerOutcome {
                    name: spec.name.clone(),
                    zone: spec.zone.clone(),
                    action: ServerAction::Started,
                    result,
                });
            }
            self.delete_batch_keys(&keys).await;
        }

        // Balance only the servers that made it.
        let members: Vec<MemberServer> = outcomes
            .iter()
            .filter_map(|o| {
                o.result.as_ref().ok().map(|id| MemberServer {
                    name: o.name.clone(),
                    instance_id: id.clone(),
                    zone: o.zone.clone(),
                })
            })
            .collect();

        let mut balancers = Vec::new();
        for lb_spec in &self.group.load_balancers {
            let reconciler = LoadBalancerReconciler::new(
                lb_spec.clone(),
                self.clients.load_balancer(&lb_spec.region),
                self.clients.dns(),
            );
            let result = reconciler.reconcile(&members).await;
            if let Err(e) = &result {
                error!("balancer {} failed to reconcile: {e}", lb_spec.name);
            }
            balancers.push(BalancerOutcome {
                name: lb_spec.name.clone(),
                result,
            });
        }

        Ok(LaunchReport {
            outcomes,
            balancers,
        })
    }

    /// Running-state probe for every server in the group
    pub async fn status(&self) -> Result<Vec<ServerStatus>> {
        let mut statuses = Vec::new();
        for spec in &self.group.servers {
            let live = match self.reconciler_for(spec)?.running_state().await? {
                Some(id) => {
                    let desc = self.compute_for(spec)?.describe_instance(&id).await?;
                    LiveServerState {
                        instance_id: Some(desc.instance_id),
                        dns_name: desc.dns_name,
                        state: desc.state,
                        launch_time: desc.launch_time,
                    }
                }
                None => LiveServerState::default(),
            };
            statuses.push(ServerStatus {
                name: spec.name.clone(),
                zone: spec.zone.clone(),
                live,
            });
        }
        Ok(statuses)
    }

    /// Membership health of every declared load balancer
    pub async fn balancer_status(&self) -> Result<Vec<BalancerStatus>> {
        let mut statuses = Vec::new();
        for lb_spec in &self.group.load_balancers {
            let api = self.clients.load_balancer(&lb_spec.region);
            let members = match api.describe(&lb_spec.name).await? {
                Some(_) => api.health_status(&lb_spec.name).await?,
                None => Vec::new(),
            };
            statuses.push(BalancerStatus {
                name: lb_spec.name.clone(),
                members,
            });
        }
        Ok(statuses)
    }

    fn select_servers(&self, requested: &[String]) -> Result<Vec<&ServerSpec>> {
        if requested.is_empty() {
            return Ok(self.group.servers.iter().collect());
        }
        requested
            .iter()
            .map(|name| {
                self.group.server(name).ok_or_else(|| {
                    Error::ConfigError(format!(
                        "unknown server '{name}' in group '{}'",
                        self.group.name
                    ))
                })
            })
            .collect()
    }

    fn compute_for(&self, spec: &ServerSpec) -> Result<Arc<dyn ComputeApi>> {
        Ok(self.clients.compute(&spec.region()?))
    }

    fn reconciler_for(&self, spec: &ServerSpec) -> Result<ServerReconciler> {
        let compute = self.compute_for(spec)?;
        let trust = Arc::new(TrustEstablisher::new(
            Arc::clone(&compute),
            Arc::clone(&self.scanner),
            Arc::clone(&self.resolver),
            Arc::clone(&self.store),
        ));
        Ok(ServerReconciler::new(
            self.group.instance_tag(spec),
            spec.clone(),
            compute,
            Arc::clone(&self.ssh),
            trust,
            Arc::clone(&self.resolver),
        ))
    }

    async fn start_one(&self, spec: &ServerSpec, keys: &BatchKeys) -> Result<String> {
        let region = spec.region()?;
        let key_pair = keys.by_region.get(&region).ok_or_else(|| {
            Error::ConfigError(format!("no key pair registered for region {region}"))
        })?;
        self.reconciler_for(spec)?.start(key_pair).await
    }

    /// Key pairs are regional; one shared name is registered in every
    /// region that has a missing server.
    async fn create_batch_keys(&self, missing: &[&ServerSpec]) -> Result<BatchKeys> {
        let name = format!(
            "fleet-{}-{}-{:04x}",
            self.group.name,
            Utc::now().timestamp(),
            rand::random::<u16>()
        );
        let mut by_region = HashMap::new();
        for spec in missing {
            let region = spec.region()?;
            if by_region.contains_key(&region) {
                continue;
            }
            let material = self.clients.compute(&region).create_key_pair(&name).await?;
            let key_path = self.temp_dir.join(format!("{name}-{region}.pem"));
            tokio::fs::write(&key_path, &material.private_key).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                    .await?;
            }
            by_region.insert(
                region,
                TemporaryKeyPair {
                    name: material.name,
                    key_path,
                },
            );
        }
        Ok(BatchKeys { by_region })
    }

    /// Best effort; a leaked key pair is logged, never fatal
    async fn delete_batch_keys(&self, keys: &BatchKeys) {
        for (region, key_pair) in &keys.by_region {
            if let Err(e) = self
                .clients
                .compute(region)
                .delete_key_pair(&key_pair.name)
                .await
            {
                warn!("could not delete key pair {} in {region}: {e}", key_pair.name);
            }
            if let Err(e) = tokio::fs::remove_file(&key_pair.key_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove {}: {e}", key_pair.key_path.display());
                }
            }
        }
    }
}
