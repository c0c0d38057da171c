use std::sync::Arc;

use super::testing::*;
use super::FleetOrchestrator;
use crate::error::Error;
use crate::reconciler::ServerAction;
use crate::spec::{FleetGroup, InstanceState, LoadBalancerSpec, ServerSpec};
use crate::ssh::KnownHostsStore;

struct Harness {
    orchestrator: FleetOrchestrator,
    log: Arc<EventLog>,
    compute: Arc<MockCompute>,
    load_balancer: Arc<MockLoadBalancer>,
    dns: Arc<MockDns>,
    dir: tempfile::TempDir,
}

fn harness(group: FleetGroup) -> Harness {
    let log = Arc::new(EventLog::default());
    let compute = Arc::new(MockCompute::new(Arc::clone(&log)));
    let load_balancer = Arc::new(MockLoadBalancer::new(Arc::clone(&log)));
    let dns = Arc::new(MockDns::new(Arc::clone(&log)));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(KnownHostsStore::new(dir.path().join("known_hosts")));
    let orchestrator = FleetOrchestrator::new(
        group,
        Arc::new(MockClients {
            compute: Arc::clone(&compute),
            load_balancer: Arc::clone(&load_balancer),
            dns: Arc::clone(&dns),
        }),
        Arc::new(MockSsh {
            log: Arc::clone(&log),
        }),
        Arc::new(MockScanner::agreeing()),
        Arc::new(MockResolver),
        store,
        dir.path().to_path_buf(),
    );
    Harness {
        orchestrator,
        log,
        compute,
        load_balancer,
        dns,
        dir,
    }
}

fn server(name: &str) -> ServerSpec {
    ServerSpec::builder(name)
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .build()
        .unwrap()
}

fn group() -> FleetGroup {
    FleetGroup::builder("prod")
        .domain("example.net")
        .server(server("web1"))
        .server(server("web2"))
        .load_balancer(
            LoadBalancerSpec::builder("lb-prod", "eu-west-1")
                .dns_alias("www")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_launch_partitions_refreshes_and_starts() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    h.compute.will_launch("i-2", 1, "h2");

    let report = h.orchestrator.launch(&[]).await.unwrap();

    assert!(report.all_succeeded());
    assert_eq!(report.outcomes.len(), 2);
    let web1 = report.outcomes.iter().find(|o| o.name == "web1").unwrap();
    let web2 = report.outcomes.iter().find(|o| o.name == "web2").unwrap();
    assert_eq!(web1.action, ServerAction::Refreshed);
    assert_eq!(web2.action, ServerAction::Started);
    assert_eq!(web1.result.as_deref().unwrap(), "i-1");
    assert_eq!(web2.result.as_deref().unwrap(), "i-2");

    // shared key pair: created before the start, deleted after it
    assert!(h.log.position("create_key_pair") < h.log.position("launch"));
    assert!(h.log.position("launch") < h.log.position("delete_key_pair"));
}

#[tokio::test(start_paused = true)]
async fn test_launch_reconciles_balancer_with_completed_servers() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    h.compute.will_launch("i-2", 0, "h2");

    h.orchestrator.launch(&[]).await.unwrap();

    assert!(h.log.contains("create lb-prod zones=[\"eu-west-1a\"]"));
    assert!(h.log.contains("register [\"i-1\", \"i-2\"]"));
    assert!(h.log.contains("health_check TCP:80"));
    // bare alias was qualified with the group domain
    assert!(h.log.contains("create_zone example.net"));
    assert!(h
        .log
        .contains("add_alias www.example.net lb-prod.balancer.example.net"));
    assert!(h.dns.aliases.lock().unwrap().contains_key("www.example.net"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_server_is_isolated_and_excluded_from_balancing() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    // no launch id queued: web2's launch fails with an API error

    let report = h.orchestrator.launch(&[]).await.unwrap();

    assert!(!report.all_succeeded());
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.succeeded().count(), 1);

    assert!(h.log.contains("register [\"i-1\"]"));
    // the key pair is cleaned up even though the start failed
    assert!(h.log.contains("delete_key_pair"));
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_does_not_abort_siblings() {
    let mut g = group();
    g.servers[0] = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .build()
        .unwrap();
    let h = harness(g);
    h.compute.volume_describe_fails("vol-1");
    h.compute
        .tagged_as("prod-web2", described("i-2", InstanceState::Running, "h2"));

    let report = h.orchestrator.launch(&[]).await.unwrap();

    assert!(!report.all_succeeded());
    let web1 = report.outcomes.iter().find(|o| o.name == "web1").unwrap();
    let web2 = report.outcomes.iter().find(|o| o.name == "web2").unwrap();
    assert_eq!(web1.action, ServerAction::Probed);
    assert!(matches!(web1.result, Err(Error::ApiError { .. })));
    assert_eq!(web2.action, ServerAction::Refreshed);
    assert_eq!(web2.result.as_deref().unwrap(), "i-2");

    // the failed server is excluded from balancing and never started
    assert!(h.log.contains("register [\"i-2\"]"));
    assert!(!h.log.contains("launch"));
    assert!(!h.log.contains("create_key_pair"));
}

#[tokio::test(start_paused = true)]
async fn test_balancer_failure_preserves_server_outcomes() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    h.compute.will_launch("i-2", 0, "h2");
    h.load_balancer.health_check_fails();

    let report = h.orchestrator.launch(&[]).await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(|o| o.result.is_ok()));
    assert_eq!(report.failed_balancers().count(), 1);
    assert!(matches!(
        report.balancers[0].result,
        Err(Error::ApiError { .. })
    ));
    assert!(!report.all_succeeded());
}

#[tokio::test(start_paused = true)]
async fn test_state_conflict_aborts_before_any_mutation() {
    let mut g = group();
    g.servers[0] = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .build()
        .unwrap();
    let h = harness(g);
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    h.compute.volume_attached_to("vol-1", "i-9");

    let result = h.orchestrator.launch(&[]).await;

    assert!(matches!(result, Err(Error::ServerStateConflict { .. })));
    assert!(!h.log.contains("launch"));
    assert!(!h.log.contains("create_key_pair"));
}

#[tokio::test(start_paused = true)]
async fn test_launch_subset_only_touches_requested_servers() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));

    let report = h.orchestrator.launch(&["web1".to_string()]).await.unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert!(!h.log.contains("launch"));
    assert!(!h.log.contains("create_key_pair"));
}

#[tokio::test]
async fn test_unknown_server_name_is_rejected() {
    let h = harness(group());
    let result = h.orchestrator.launch(&["nope".to_string()]).await;
    assert!(matches!(result, Err(Error::ConfigError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_key_material_removed_from_disk() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    h.compute.will_launch("i-2", 0, "h2");

    h.orchestrator.launch(&[]).await.unwrap();

    let leftover: Vec<_> = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "pem"))
        .collect();
    assert!(leftover.is_empty(), "key material left behind: {leftover:?}");
}

#[tokio::test]
async fn test_status_reports_running_and_missing() {
    let h = harness(group());
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));

    let statuses = h.orchestrator.status().await.unwrap();

    assert_eq!(statuses.len(), 2);
    let web1 = statuses.iter().find(|s| s.name == "web1").unwrap();
    let web2 = statuses.iter().find(|s| s.name == "web2").unwrap();
    assert_eq!(web1.live.instance_id.as_deref(), Some("i-1"));
    assert_eq!(web1.live.state, InstanceState::Running);
    assert!(web2.live.instance_id.is_none());

    // no balancer exists yet, so there is nothing to report health for
    let balancers = h.orchestrator.balancer_status().await.unwrap();
    assert_eq!(balancers.len(), 1);
    assert!(balancers[0].members.is_empty());
}
