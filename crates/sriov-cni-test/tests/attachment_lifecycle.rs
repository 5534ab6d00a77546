//! ADD/DEL lifecycle tests
//!
//! Drives the orchestrator against a fake node and checks what each
//! invocation leaves behind.

use pretty_assertions::{assert_eq, assert_ne};
use sriov_cni::driver::DriverOps;
use sriov_cni::result::CniResult;
use sriov_cni::{BindMode, PciAddress, VfState};
use sriov_cni_common::SriovError;
use sriov_cni_test::{
    netconf_fixtures, FakeIpam, FakeNode, LinkOpKind, TestEnv, HOST, KERNEL_DRIVER,
};

/// Scenario:
/// 1. ADD a kernel-mode attachment
/// 2. DEL it
/// 3. ADD again for another container and get the same VF
#[tokio::test]
async fn test_add_del_leaves_vf_reassignable() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::kernel("enp3s0f0");

    let result = env
        .attachments
        .add(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    let ip4 = result.ip4.as_ref().unwrap();
    assert_eq!(ip4.ip.to_string(), "10.56.217.70/24");
    assert_eq!(result.dns.nameservers, vec!["10.56.217.1".to_string()]);
    assert_eq!(result.interfaces[0].name, "net0");
    assert_eq!(
        result.interfaces[0].pci_address.as_deref(),
        Some(FakeNode::pci_addr(0).as_str())
    );

    let ns_key = ns.display().to_string();
    let link = env.links.link(&ns_key, "net0").unwrap();
    assert!(link.up);
    assert_eq!(link.addresses.len(), 1);
    assert_eq!(link.routes.len(), 1);
    assert_eq!(env.links.link(HOST, "enp3s0f0v0"), None);

    let verifier = env.verifier();
    verifier.assert_free_count(1).unwrap();
    verifier.assert_owner(0, Some("c1")).unwrap();
    verifier.assert_record("c1", "net0", true).unwrap();

    env.attachments
        .del(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    assert!(env.links.links_in(&ns_key).is_empty());
    assert!(env.links.link(HOST, "enp3s0f0v0").is_some());
    verifier.assert_free_count(2).unwrap();
    verifier.assert_vf_state(0, VfState::Free).unwrap();
    verifier.assert_record("c1", "net0", false).unwrap();
    assert_eq!(env.ipam.adds(), 1);
    assert_eq!(env.ipam.dels(), 1);

    let ns2 = env.node.namespace("c2");
    let again = env
        .attachments
        .add(&env.node.request("c2", Some(ns2.as_path()), "net0", &payload))
        .await
        .unwrap();
    assert_eq!(again.interfaces[0].pci_address, result.interfaces[0].pci_address);
}

#[tokio::test]
async fn test_shared_without_l2_fails_before_any_operation() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");

    let err = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::shared("enp3s0f0", false),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, SriovError::Config { .. }));
    assert_eq!(env.links.op_count(), 0);
    assert_eq!(env.ipam.adds(), 0);
    assert!(!env.node.settings.lock_dir.exists());
}

#[tokio::test]
async fn test_del_with_vanished_namespace() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::kernel("enp3s0f0");

    env.attachments
        .add(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    // Node restart: the namespace is gone and the VF is back in the host
    // under its container name.
    env.links.destroy_namespace(&ns);
    assert!(env.links.link(HOST, "net0").is_some());

    env.attachments
        .del(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    assert_eq!(env.ipam.dels(), 1);
    assert!(env.links.link(HOST, "enp3s0f0v0").is_some());
    assert_eq!(env.links.link(HOST, "net0"), None);
    let verifier = env.verifier();
    verifier.assert_free_count(2).unwrap();
    verifier.assert_record("c1", "net0", false).unwrap();
}

#[tokio::test]
async fn test_del_without_namespace_path() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::kernel("enp3s0f0");

    env.attachments
        .add(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();
    env.links.destroy_namespace(&ns);

    env.attachments
        .del(&env.node.request("c1", None, "net0", &payload))
        .await
        .unwrap();

    assert_eq!(env.ipam.dels(), 1);
    env.verifier().assert_free_count(1).unwrap();
}

#[tokio::test]
async fn test_del_twice_is_noop() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::l2("enp3s0f0");
    let request = env.node.request("c1", Some(ns.as_path()), "net0", &payload);

    env.attachments.add(&request).await.unwrap();
    env.attachments.del(&request).await.unwrap();
    let ops = env.links.op_count();

    env.attachments.del(&request).await.unwrap();
    assert_eq!(env.links.op_count(), ops);
    env.verifier().assert_free_count(2).unwrap();
}

#[tokio::test]
async fn test_dpdk_with_ipam_writes_handoff_file() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::dpdk("enp3s0f0");

    let result = env
        .attachments
        .add(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    assert_eq!(env.ipam.adds(), 1);
    assert_eq!(env.links.op_count(), 0);
    assert_eq!(result.dns.nameservers, vec!["10.56.218.1".to_string()]);
    assert_eq!(result.dns.search, vec!["svc.local".to_string()]);
    assert_eq!(result.interfaces[0].sandbox, None);

    let path = env.node.cni_dir().join("c1-net0-ipam");
    let written: CniResult = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written.ip4, result.ip4);
    assert_eq!(written.dns, result.dns);

    let verifier = env.verifier();
    verifier
        .assert_vf_state(0, VfState::Bound(BindMode::Dpdk))
        .unwrap();

    env.attachments
        .del(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap();

    verifier.assert_vf_state(0, VfState::Free).unwrap();
    // The handoff file outlives the attachment.
    verifier.assert_handoff("c1", "net0", true).unwrap();
    assert_eq!(
        env.drivers.binds().last().map(|(_, d)| d.as_str()),
        Some("ixgbevf")
    );
}

#[tokio::test]
async fn test_dpdk_driver_failure_restores_kernel_driver() {
    let env = TestEnv::new(1);
    env.drivers.fail_on("vfio-pci");
    let ns = env.node.namespace("c1");

    let err = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::dpdk("enp3s0f0"),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 104);
    assert_eq!(env.ipam.adds(), 0);
    let verifier = env.verifier();
    verifier.assert_free_count(1).unwrap();
    verifier.assert_record("c1", "net0", false).unwrap();
}

#[tokio::test]
async fn test_missing_ip4_releases_vf() {
    let env = TestEnv::with_ipam(2, FakeIpam::without_ip4());
    let ns = env.node.namespace("c1");
    let before = env.verifier().free_count().unwrap();

    let err = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::kernel("enp3s0f0"),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, SriovError::AddressConfigMissing { .. }));
    assert_eq!(env.verifier().free_count().unwrap(), before);
    assert_eq!(env.ipam.dels(), 1);
    assert!(env.links.links_in(&ns.display().to_string()).is_empty());
    env.verifier().assert_record("c1", "net0", false).unwrap();
}

#[tokio::test]
async fn test_ipam_failure_is_reported_with_backend_code() {
    let env = TestEnv::with_ipam(1, FakeIpam::failing());
    let ns = env.node.namespace("c1");

    let err = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::kernel("enp3s0f0"),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 11);
    env.verifier().assert_free_count(1).unwrap();
}

#[tokio::test]
async fn test_l2_returns_empty_address_result() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");

    let result = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::l2("enp3s0f0"),
        ))
        .await
        .unwrap();

    assert_eq!(result.ip4, None);
    assert_eq!(result.ip6, None);
    assert_eq!(env.ipam.adds(), 0);

    let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(json["cniVersion"], "0.2.0");
    assert_eq!(json["interfaces"][0]["name"], "net0");
    assert!(json.get("ip4").is_none());
}

#[tokio::test]
async fn test_override_with_missing_field() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");
    let payload =
        netconf_fixtures::device_override(Some(&FakeNode::pci_addr(0)), None, Some("enp3s0f0"));

    let err = env
        .attachments
        .add(&env.node.request("c1", Some(ns.as_path()), "net0", &payload))
        .await
        .unwrap_err();

    match err {
        SriovError::DeviceMissingFields { missing } => assert_eq!(missing, "vfid"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(env.links.op_count(), 0);
}

/// Scenario:
/// 1. ADD with an explicit device override naming VF1
/// 2. An exclusive ADD for another container must not get VF1
/// 3. DEL of the override gives VF1 back
#[tokio::test]
async fn test_override_skips_allocation_but_claims_the_vf() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    let payload =
        netconf_fixtures::device_override(Some(&FakeNode::pci_addr(1)), Some(1), Some("enp3s0f0"));
    let request = env.node.request("c1", Some(ns.as_path()), "net0", &payload);

    let result = env.attachments.add(&request).await.unwrap();

    assert_eq!(
        result.interfaces[0].pci_address.as_deref(),
        Some(FakeNode::pci_addr(1).as_str())
    );
    let verifier = env.verifier();
    verifier.assert_owner(1, Some("c1")).unwrap();

    let ns2 = env.node.namespace("c2");
    let other = env
        .attachments
        .add(&env.node.request(
            "c2",
            Some(ns2.as_path()),
            "net0",
            &netconf_fixtures::l2("enp3s0f0"),
        ))
        .await
        .unwrap();
    assert_eq!(
        other.interfaces[0].pci_address.as_deref(),
        Some(FakeNode::pci_addr(0).as_str())
    );

    env.attachments.del(&request).await.unwrap();
    verifier.assert_owner(1, None).unwrap();
    verifier.assert_free_count(1).unwrap();
}

#[tokio::test]
async fn test_failed_rename_moves_vf_back_and_releases_claim() {
    let env = TestEnv::new(2);
    let ns = env.node.namespace("c1");
    env.links.fail_next(LinkOpKind::Rename);

    let err = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "net0",
            &netconf_fixtures::kernel("enp3s0f0"),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.code(), 107);
    let host = env.links.link(HOST, "enp3s0f0v0").unwrap();
    assert!(!host.up);
    assert!(env.links.links_in(&ns.display().to_string()).is_empty());
    let verifier = env.verifier();
    verifier.assert_owner(0, None).unwrap();
    verifier.assert_free_count(2).unwrap();
    assert_eq!(env.ipam.adds(), 0);
}

#[tokio::test]
async fn test_vlan_is_programmed_and_cleared() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");
    let payload = netconf_fixtures::kernel_vlan("enp3s0f0", 100);
    let request = env.node.request("c1", Some(ns.as_path()), "net0", &payload);

    env.attachments.add(&request).await.unwrap();
    assert_eq!(env.links.vlan("enp3s0f0", 0), 100);

    env.attachments.del(&request).await.unwrap();
    assert_eq!(env.links.vlan("enp3s0f0", 0), 0);
}

#[tokio::test]
async fn test_shared_vf_attachments() {
    let env = TestEnv::new(1);
    let payload = netconf_fixtures::shared("enp3s0f0", true);
    let ns1 = env.node.namespace("c1");
    let ns2 = env.node.namespace("c2");

    for (cid, ns) in [("c1", &ns1), ("c2", &ns2)] {
        env.attachments
            .add(&env.node.request(cid, Some(ns.as_path()), "net0", &payload))
            .await
            .unwrap();
    }

    // Both containers got a child link; the VF itself stayed in the host.
    assert!(env.links.link(HOST, "enp3s0f0v0").is_some());
    assert!(env.links.link(&ns1.display().to_string(), "net0").is_some());
    assert!(env.links.link(&ns2.display().to_string(), "net0").is_some());
    let verifier = env.verifier();
    verifier.assert_owner(0, None).unwrap();
    verifier.assert_vf_state(0, VfState::Shared).unwrap();

    env.attachments
        .del(&env.node.request("c1", Some(ns1.as_path()), "net0", &payload))
        .await
        .unwrap();
    assert!(env.links.links_in(&ns1.display().to_string()).is_empty());
    assert!(env.links.link(&ns2.display().to_string(), "net0").is_some());
    verifier.assert_vf_state(0, VfState::Shared).unwrap();

    env.attachments
        .del(&env.node.request("c2", Some(ns2.as_path()), "net0", &payload))
        .await
        .unwrap();
    verifier.assert_vf_state(0, VfState::Free).unwrap();
}

#[tokio::test]
async fn test_shared_vf_is_not_handed_out_exclusively() {
    let env = TestEnv::new(2);
    let ns1 = env.node.namespace("c1");
    let ns2 = env.node.namespace("c2");

    let shared = env
        .attachments
        .add(&env.node.request(
            "c1",
            Some(ns1.as_path()),
            "net0",
            &netconf_fixtures::shared("enp3s0f0", true),
        ))
        .await
        .unwrap();
    let exclusive = env
        .attachments
        .add(&env.node.request(
            "c2",
            Some(ns2.as_path()),
            "net0",
            &netconf_fixtures::l2("enp3s0f0"),
        ))
        .await
        .unwrap();

    assert_ne!(
        shared.interfaces[0].pci_address,
        exclusive.interfaces[0].pci_address
    );
    assert!(env.links.link(HOST, "enp3s0f0v0").is_some());
    env.verifier().assert_free_count(0).unwrap();
}

/// Scenario:
/// 1. ADD c1 in DPDK mode
/// 2. Node restarts: claims are lost and VF0 is back on its kernel driver,
///    while c1's attachment record survives
/// 3. ADD c2 in DPDK mode and get VF0
/// 4. The runtime's late DEL for c1 must not touch c2's VF
#[tokio::test]
async fn test_del_after_restart_leaves_reassigned_vf_alone() {
    let env = TestEnv::new(1);
    let payload = netconf_fixtures::dpdk("enp3s0f0");
    let ns1 = env.node.namespace("c1");

    env.attachments
        .add(&env.node.request("c1", Some(ns1.as_path()), "net0", &payload))
        .await
        .unwrap();

    std::fs::remove_dir_all(&env.node.settings.lock_dir).unwrap();
    let vf0: PciAddress = FakeNode::pci_addr(0).parse().unwrap();
    env.drivers.bind(&vf0, KERNEL_DRIVER, None).await.unwrap();
    let verifier = env.verifier();
    verifier.assert_vf_state(0, VfState::Free).unwrap();
    verifier.assert_record("c1", "net0", true).unwrap();

    let ns2 = env.node.namespace("c2");
    env.attachments
        .add(&env.node.request("c2", Some(ns2.as_path()), "net0", &payload))
        .await
        .unwrap();
    verifier.assert_owner(0, Some("c2")).unwrap();
    let binds = env.drivers.binds().len();

    env.attachments
        .del(&env.node.request("c1", None, "net0", &payload))
        .await
        .unwrap();

    assert_eq!(env.drivers.binds().len(), binds);
    verifier
        .assert_vf_state(0, VfState::Bound(BindMode::Dpdk))
        .unwrap();
    verifier.assert_owner(0, Some("c2")).unwrap();
    verifier.assert_record("c1", "net0", false).unwrap();
    verifier.assert_record("c2", "net0", true).unwrap();
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let env = TestEnv::new(1);
    let payload = netconf_fixtures::l2("enp3s0f0");
    let ns1 = env.node.namespace("c1");
    let ns2 = env.node.namespace("c2");

    env.attachments
        .add(&env.node.request("c1", Some(ns1.as_path()), "net0", &payload))
        .await
        .unwrap();
    let err = env
        .attachments
        .add(&env.node.request("c2", Some(ns2.as_path()), "net0", &payload))
        .await
        .unwrap_err();

    assert!(matches!(err, SriovError::ResourceExhausted { .. }));
    env.verifier().assert_owner(0, Some("c1")).unwrap();
}

#[tokio::test]
async fn test_ipam_receives_cni_environment() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");

    env.attachments
        .add(&env.node.request(
            "c1",
            Some(ns.as_path()),
            "eth1",
            &netconf_fixtures::kernel("enp3s0f0"),
        ))
        .await
        .unwrap();

    let ipam_env = env.ipam.last_env().unwrap();
    assert_eq!(ipam_env.container_id, "c1");
    assert_eq!(ipam_env.ifname, "eth1");
    assert_eq!(ipam_env.netns, ns.display().to_string());
}

#[tokio::test]
async fn test_ipam_release_failure_does_not_block_teardown() {
    let env = TestEnv::new(1);
    let ns = env.node.namespace("c1");
    let request = env.node.request("c1", Some(ns.as_path()), "net0", &netconf_fixtures::kernel("enp3s0f0"));

    env.attachments.add(&request).await.unwrap();
    env.ipam.fail_releases();
    env.attachments.del(&request).await.unwrap();

    env.verifier().assert_free_count(1).unwrap();
}
