//! SR-IOV CNI plugin
//!
//! Hands SR-IOV virtual functions to container network namespaces:
//! - VF pool inspection and cross-process allocation
//! - Moving, renaming or sharing the VF netdev, or rebinding it to a
//!   userspace I/O driver
//! - IPAM coordination and the DPDK handoff file
//! - Teardown that survives vanished namespaces and node restarts

pub mod allocator;
pub mod attachment;
pub mod binder;
pub mod config;
pub mod driver;
pub mod inspector;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod record;
pub mod result;
pub mod skel;
pub mod types;

#[cfg(test)]
mod testutil;

pub use attachment::{AddState, Attachments, CniRequest};
pub use binder::{BoundInterface, InterfaceBinder};
pub use config::{NetConf, PluginSettings};
pub use types::{BindMode, PciAddress, VfRef, VfState};
