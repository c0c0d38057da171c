//! Load-balancer reconciliation
//!
//! The balancer is never torn down and recreated. Membership and zones are
//! diffed against live state, listeners are replaced wholesale, cookie
//! policies are torn down and rebuilt, and the health check is pushed
//! unconditionally.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clients::{AliasTarget, DnsApi, LoadBalancerApi, LoadBalancerDescription};
use crate::error::{Error, Result};
use crate::spec::{LoadBalancerSpec, StickyCookiePolicy};

/// A server eligible for balancing, as produced by a fleet run
#[derive(Clone, Debug)]
pub struct MemberServer {
    pub name: String,
    pub instance_id: String,
    pub zone: String,
}

pub struct LoadBalancerReconciler {
    spec: LoadBalancerSpec,
    api: Arc<dyn LoadBalancerApi>,
    dns: Arc<dyn DnsApi>,
}

impl LoadBalancerReconciler {
    pub fn new(
        spec: LoadBalancerSpec,
        api: Arc<dyn LoadBalancerApi>,
        dns: Arc<dyn DnsApi>,
    ) -> Self {
        Self { spec, api, dns }
    }

    /// Drive the live balancer to the declared state
    pub async fn reconcile(&self, servers: &[MemberServer]) -> Result<()> {
        let members: Vec<&MemberServer> = servers
            .iter()
            .filter(|s| self.spec.balances(&s.name))
            .collect();
        info!(
            "reconciling load balancer {} ({} members)",
            self.spec.name,
            members.len()
        );

        let live = self.describe_or_create(&members).await?;

        self.reconcile_membership(&live, &members).await?;
        self.reconcile_zones(&live, &members).await?;
        self.replace_listeners(&live).await?;
        self.rebuild_sticky_policies().await?;
        self.api
            .configure_health_check(&self.spec.name, &self.spec.health_check)
            .await?;

        if let Some(alias) = &self.spec.dns_alias {
            self.reconcile_alias(alias, &live).await?;
        }
        Ok(())
    }

    async fn describe_or_create(
        &self,
        members: &[&MemberServer],
    ) -> Result<LoadBalancerDescription> {
        if let Some(live) = self.api.describe(&self.spec.name).await? {
            return Ok(live);
        }
        let zones = if members.is_empty() {
            vec![format!("{}a", self.spec.region)]
        } else {
            dedup(members.iter().map(|m| m.zone.clone()))
        };
        info!("creating load balancer {} in {zones:?}", self.spec.name);
        self.api
            .create(&self.spec.name, &zones, &self.spec.listeners)
            .await?;
        self.api
            .describe(&self.spec.name)
            .await?
            .ok_or_else(|| Error::ApiError {
                operation: "describe_load_balancer".to_string(),
                status: 404,
                message: format!("{} missing right after creation", self.spec.name),
            })
    }

    async fn reconcile_membership(
        &self,
        live: &LoadBalancerDescription,
        members: &[&MemberServer],
    ) -> Result<()> {
        let desired = dedup(members.iter().map(|m| m.instance_id.clone()));
        let additions: Vec<String> = desired
            .iter()
            .filter(|id| !live.instances.contains(id))
            .cloned()
            .collect();
        let removals: Vec<String> = live
            .instances
            .iter()
            .filter(|id| !desired.contains(id))
            .cloned()
            .collect();

        if additions.is_empty() && removals.is_empty() {
            debug!("{}: membership up to date", self.spec.name);
            return Ok(());
        }
        if !additions.is_empty() {
            info!("{}: registering {additions:?}", self.spec.name);
            self.api
                .register_instances(&self.spec.name, &additions)
                .await?;
        }
        if !removals.is_empty() {
            info!("{}: deregistering {removals:?}", self.spec.name);
            self.api
                .deregister_instances(&self.spec.name, &removals)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_zones(
        &self,
        live: &LoadBalancerDescription,
        members: &[&MemberServer],
    ) -> Result<()> {
        let desired = dedup(members.iter().map(|m| m.zone.clone()));
        let additions: Vec<String> = desired
            .iter()
            .filter(|z| !live.zones.contains(z))
            .cloned()
            .collect();
        let removals: Vec<String> = live
            .zones
            .iter()
            .filter(|z| !desired.contains(z))
            .cloned()
            .collect();

        if additions.is_empty() && removals.is_empty() {
            debug!("{}: zones up to date", self.spec.name);
            return Ok(());
        }
        // Enable before disable so the balancer always keeps one live zone
        if !additions.is_empty() {
            self.api.enable_zones(&self.spec.name, &additions).await?;
        }
        if !removals.is_empty() {
            self.api.disable_zones(&self.spec.name, &removals).await?;
        }
        Ok(())
    }

    /// Listeners are not diffed; the declared set replaces whatever is live
    async fn replace_listeners(&self, live: &LoadBalancerDescription) -> Result<()> {
        let previous: Vec<u16> = live
            .listeners
            .iter()
            .map(|l| l.load_balancer_port)
            .collect();
        if !previous.is_empty() {
            self.api.delete_listeners(&self.spec.name, &previous).await?;
        }
        self.api
            .create_listeners(&self.spec.name, &self.spec.listeners)
            .await
    }

    /// Teardown is unconditional so stale policies from earlier runs never
    /// survive; a `Disabled` declaration rebuilds nothing.
    async fn rebuild_sticky_policies(&self) -> Result<()> {
        for listener in &self.spec.listeners {
            self.api
                .clear_listener_policies(&self.spec.name, listener.load_balancer_port)
                .await?;
        }
        for policy in &self.spec.sticky_cookies {
            match policy {
                StickyCookiePolicy::Disabled { ports } => {
                    debug!("{}: sticky cookies stay disabled on {ports:?}", self.spec.name);
                }
                StickyCookiePolicy::LbGenerated {
                    ports,
                    expiration_secs,
                } => {
                    self.api
                        .set_lb_cookie_policy(&self.spec.name, ports, *expiration_secs)
                        .await?;
                }
                StickyCookiePolicy::AppGenerated { ports, cookie_name } => {
                    self.api
                        .set_app_cookie_policy(&self.spec.name, ports, cookie_name)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Point `alias` at the balancer's canonical target, creating the
    /// hosted zone for the alias's parent domain when absent.
    async fn reconcile_alias(&self, alias: &str, live: &LoadBalancerDescription) -> Result<()> {
        let zone = alias.split_once('.').map(|(_, parent)| parent).unwrap_or(alias);
        if !self.dns.zone_exists(zone).await? {
            info!("creating hosted zone {zone}");
            self.dns.create_zone(zone).await?;
        }

        let desired = AliasTarget {
            dns_name: live.dns_name.clone(),
            hosted_zone_id: live.canonical_zone_id.clone(),
        };
        match self.dns.alias_target(alias).await? {
            Some(current) if dns_name_eq(&current.dns_name, &desired.dns_name) => {
                debug!("alias {alias} already points at {}", desired.dns_name);
                Ok(())
            }
            Some(stale) => {
                info!("alias {alias}: replacing stale target {}", stale.dns_name);
                self.dns.remove_alias_records(alias).await?;
                self.dns.add_alias_record(alias, &desired).await
            }
            None => {
                info!("alias {alias} -> {}", desired.dns_name);
                self.dns.add_alias_record(alias, &desired).await
            }
        }
    }
}

/// DNS names compare case-insensitively and ignoring the trailing dot
fn dns_name_eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
