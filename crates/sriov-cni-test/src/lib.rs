//! Integration test infrastructure for the SR-IOV CNI plugin
//!
//! Provides:
//! - A fake node with a sysfs tree, state directories and namespace files
//! - Descriptor fixtures for each attachment mode
//! - Link, driver and IPAM fakes that keep the fake sysfs in step
//! - Node state verification helpers

pub mod fakes;
pub mod fixtures;
mod verification;

pub use fakes::{FakeDrivers, FakeIpam, FakeLink, LinkOpKind, RecordingLinks, HOST};
pub use fixtures::*;
pub use verification::*;

use std::sync::Arc;

use sriov_cni::Attachments;

/// A fake node wired to a plugin instance
pub struct TestEnv {
    pub node: FakeNode,
    pub links: Arc<RecordingLinks>,
    pub drivers: Arc<FakeDrivers>,
    pub ipam: Arc<FakeIpam>,
    pub attachments: Attachments,
}

impl TestEnv {
    /// A node with `num_vfs` VFs and an IPAM that hands out addresses.
    pub fn new(num_vfs: u32) -> Self {
        Self::with_ipam(num_vfs, FakeIpam::with_address(70))
    }

    pub fn with_ipam(num_vfs: u32, ipam: FakeIpam) -> Self {
        let node = FakeNode::new("enp3s0f0", num_vfs);
        let links = Arc::new(RecordingLinks::new(&node));
        let drivers = Arc::new(FakeDrivers::new(&node));
        let ipam = Arc::new(ipam);
        let attachments = Attachments::new(
            node.settings.clone(),
            links.clone(),
            drivers.clone(),
            ipam.clone(),
        );
        Self {
            node,
            links,
            drivers,
            ipam,
            attachments,
        }
    }

    pub fn verifier(&self) -> NodeVerifier<'_> {
        NodeVerifier::new(&self.node)
    }
}
