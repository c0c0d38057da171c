use std::sync::Arc;

use super::testing::*;
use super::{ServerReconciler, TemporaryKeyPair};
use crate::error::Error;
use crate::spec::{InstanceState, ServerSpec};
use crate::ssh::KnownHostsStore;
use crate::trust::TrustEstablisher;

struct Harness {
    reconciler: ServerReconciler,
    log: Arc<EventLog>,
    compute: Arc<MockCompute>,
    dir: tempfile::TempDir,
}

fn harness(spec: ServerSpec) -> Harness {
    let log = Arc::new(EventLog::default());
    let compute = Arc::new(MockCompute::new(Arc::clone(&log)));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(KnownHostsStore::new(dir.path().join("known_hosts")));
    let trust = Arc::new(TrustEstablisher::new(
        Arc::clone(&compute) as Arc<dyn crate::clients::ComputeApi>,
        Arc::new(MockScanner::agreeing()),
        Arc::new(MockResolver),
        store,
    ));
    let reconciler = ServerReconciler::new(
        format!("prod-{}", spec.name),
        spec,
        Arc::clone(&compute) as Arc<dyn crate::clients::ComputeApi>,
        Arc::new(MockSsh {
            log: Arc::clone(&log),
        }),
        trust,
        Arc::new(MockResolver),
    );
    Harness {
        reconciler,
        log,
        compute,
        dir,
    }
}

fn basic_spec(name: &str) -> ServerSpec {
    ServerSpec::builder(name)
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .build()
        .unwrap()
}

fn key_pair(dir: &tempfile::TempDir) -> TemporaryKeyPair {
    TemporaryKeyPair {
        name: "batch-key".to_string(),
        key_path: dir.path().join("batch-key.pem"),
    }
}

// ── running-state lookup ──

#[tokio::test]
async fn test_running_state_from_tag() {
    let h = harness(basic_spec("web1"));
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    assert_eq!(
        h.reconciler.running_state().await.unwrap(),
        Some("i-1".to_string())
    );
}

#[tokio::test]
async fn test_running_state_from_volume_attachment() {
    let spec = ServerSpec::builder("db1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.volume_attached_to("vol-1", "i-2");
    assert_eq!(
        h.reconciler.running_state().await.unwrap(),
        Some("i-2".to_string())
    );
}

#[tokio::test]
async fn test_running_state_none_when_both_lookups_miss() {
    let h = harness(basic_spec("web1"));
    assert_eq!(h.reconciler.running_state().await.unwrap(), None);
    assert!(!h.reconciler.is_running().await.unwrap());
}

#[tokio::test]
async fn test_running_state_agreement_is_fine() {
    let spec = ServerSpec::builder("db1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute
        .tagged_as("prod-db1", described("i-3", InstanceState::Running, "h3"));
    h.compute.volume_attached_to("vol-1", "i-3");
    assert_eq!(
        h.reconciler.running_state().await.unwrap(),
        Some("i-3".to_string())
    );
}

#[tokio::test]
async fn test_running_state_conflict_on_disagreement() {
    let spec = ServerSpec::builder("db1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute
        .tagged_as("prod-db1", described("i-3", InstanceState::Running, "h3"));
    h.compute.volume_attached_to("vol-1", "i-9");
    match h.reconciler.running_state().await {
        Err(Error::ServerStateConflict {
            server,
            tagged,
            attached,
        }) => {
            assert_eq!(server, "db1");
            assert_eq!(tagged.as_deref(), Some("i-3"));
            assert_eq!(attached.as_deref(), Some("i-9"));
        }
        other => panic!("expected ServerStateConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_running_state_conflict_when_volumes_disagree() {
    let spec = ServerSpec::builder("db1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", false)
        .disk("sdg", "vol-2", false)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.volume_attached_to("vol-1", "i-3");
    h.compute.volume_attached_to("vol-2", "i-4");
    assert!(matches!(
        h.reconciler.running_state().await,
        Err(Error::ServerStateConflict { .. })
    ));
}

// ── first-boot sequence ──

#[tokio::test(start_paused = true)]
async fn test_start_runs_first_boot_sequence_in_order() {
    let files = tempfile::tempdir().unwrap();
    let keys_file = files.path().join("team.pub");
    std::fs::write(&keys_file, "ssh-rsa AAAA operator@example\n").unwrap();
    let script = files.path().join("bootstrap.sh");
    std::fs::write(&script, "#!/bin/sh\n").unwrap();

    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .dedicated_security_group()
        .authorized_key_file(&keys_file)
        .bootstrap_script(&script)
        .disk("sdf", "vol-1", true)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.will_launch("i-42", 2, "host-1.example.net");

    let id = h.reconciler.start(&key_pair(&h.dir)).await.unwrap();
    assert_eq!(id, "i-42");

    let group = h.log.position("create_security_group prod-web1");
    let launch = h.log.position("launch image=ami-123");
    let tag = h.log.position("tag i-42 prod-web1");
    let keys = h.log.position("write root@host-1.example.net:.ssh/authorized_keys");
    let bootstrap = h.log.position("copy ");
    let format = h.log.position("run root@host-1.example.net: mkfs.ext4 -q /dev/sdf");
    let attach = h.log.position("attach vol-1 i-42 /dev/sdf");
    assert!(group < launch);
    assert!(launch < tag);
    assert!(tag < keys);
    assert!(keys < bootstrap);
    assert!(bootstrap < format);
    assert!(format < attach);

    assert!(h.log.contains("groups=[\"prod-web1\"]"));
}

#[tokio::test(start_paused = true)]
async fn test_start_formats_only_marked_disks() {
    let spec = ServerSpec::builder("db1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .disk("sdf", "vol-1", true)
        .disk("sdg", "vol-2", false)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.will_launch("i-42", 0, "host-1.example.net");

    h.reconciler.start(&key_pair(&h.dir)).await.unwrap();

    assert_eq!(h.log.count("mkfs.ext4"), 1);
    assert!(h.log.contains("mkfs.ext4 -q /dev/sdf"));
    assert!(h.log.position("mkfs.ext4 -q /dev/sdf") < h.log.position("attach vol-1"));
    assert!(h.log.contains("attach vol-2 i-42 /dev/sdg"));
}

#[tokio::test(start_paused = true)]
async fn test_start_associates_static_ip_and_retrusts_it() {
    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .ip("203.0.113.50")
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.will_launch("i-42", 0, "host-1.example.net");

    h.reconciler.start(&key_pair(&h.dir)).await.unwrap();

    assert!(h.log.contains("associate i-42 203.0.113.50"));
    let known_hosts = std::fs::read_to_string(h.dir.path().join("known_hosts")).unwrap();
    assert!(known_hosts.contains("203.0.113.50"));
}

#[tokio::test(start_paused = true)]
async fn test_start_resolves_named_static_address() {
    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .ip("www.example.net")
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.will_launch("i-42", 0, "host-1.example.net");

    h.reconciler.start(&key_pair(&h.dir)).await.unwrap();

    // MockResolver pins every name to 203.0.113.10
    assert!(h.log.contains("associate i-42 203.0.113.10"));
}

#[tokio::test(start_paused = true)]
async fn test_start_installs_keys_for_sudo_user_and_copies_to_root() {
    let files = tempfile::tempdir().unwrap();
    let keys_file = files.path().join("team.pub");
    std::fs::write(&keys_file, "ssh-rsa AAAA operator@example\n").unwrap();

    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .authorized_key_file(&keys_file)
        .sudo_user("ubuntu")
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute.will_launch("i-42", 0, "host-1.example.net");

    h.reconciler.start(&key_pair(&h.dir)).await.unwrap();

    assert!(h.log.contains("write ubuntu@host-1.example.net:.ssh/authorized_keys"));
    assert!(h.log.contains("sudo cp .ssh/authorized_keys /root/.ssh/authorized_keys"));
}

// ── refresh ──

#[tokio::test(start_paused = true)]
async fn test_refresh_reconciles_monitoring() {
    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .monitoring(true)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));

    h.reconciler.refresh("i-1").await.unwrap();

    assert!(h.log.contains("set_monitoring i-1 true"));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_skips_monitoring_when_in_sync() {
    let h = harness(basic_spec("web1"));
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));

    h.reconciler.refresh("i-1").await.unwrap();

    assert!(!h.log.contains("set_monitoring"));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_installs_keys_after_trust() {
    let files = tempfile::tempdir().unwrap();
    let keys_file = files.path().join("team.pub");
    std::fs::write(&keys_file, "ssh-rsa AAAA operator@example\n").unwrap();

    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .authorized_key_file(&keys_file)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));

    h.reconciler.refresh("i-1").await.unwrap();

    assert!(h.log.contains("write root@h1:.ssh/authorized_keys"));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_swallows_trust_failure() {
    let files = tempfile::tempdir().unwrap();
    let keys_file = files.path().join("team.pub");
    std::fs::write(&keys_file, "ssh-rsa AAAA operator@example\n").unwrap();

    let spec = ServerSpec::builder("web1")
        .zone("eu-west-1a")
        .instance_type("m1.small")
        .image_id("ami-123")
        .authorized_key_file(&keys_file)
        .build()
        .unwrap();
    let h = harness(spec);
    h.compute
        .tagged_as("prod-web1", described("i-1", InstanceState::Running, "h1"));
    // Console that never produces a fingerprint: trust fails, refresh must not
    *h.compute.console.lock().unwrap() = "still booting".to_string();

    h.reconciler.refresh("i-1").await.unwrap();

    assert!(!h.log.contains("write"));
}
