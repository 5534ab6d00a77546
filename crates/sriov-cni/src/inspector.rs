//! Device pool inspector
//!
//! Reads a PF's VFs from sysfs and derives each VF's state from its driver,
//! its host netdev and the claim records kept by the allocator. Nothing is
//! cached between calls: the OS is the only source of truth.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, instrument, warn};

use crate::allocator::ClaimStore;
use crate::config::PluginSettings;
use crate::types::{BindMode, PciAddress, PhysicalFunction, VfRef, VfState, VirtualFunction};

const VIRTFN_PREFIX: &str = "virtfn";

/// Read-only view of the SR-IOV devices on this node
#[derive(Debug, Clone)]
pub struct DevicePool {
    sysfs_root: PathBuf,
    userspace_drivers: Vec<String>,
    claims: ClaimStore,
}

impl DevicePool {
    pub fn new(settings: &PluginSettings) -> Self {
        Self {
            sysfs_root: settings.sysfs_root.clone(),
            userspace_drivers: settings.userspace_drivers.clone(),
            claims: ClaimStore::new(&settings.lock_dir),
        }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// `<sysfs>/class/net/<pf>/device`
    pub fn pf_device_dir(&self, pf: &str) -> PathBuf {
        self.sysfs_root
            .join("class/net")
            .join(pf)
            .join("device")
    }

    /// `<sysfs>/bus/pci/devices/<pci>`
    pub fn pci_device_dir(&self, pci_addr: &PciAddress) -> PathBuf {
        self.sysfs_root
            .join("bus/pci/devices")
            .join(pci_addr.as_str())
    }

    /// Lists the PF's VFs, in index order, with their current state.
    ///
    /// Fails if the PF or its device directory cannot be read. Individual
    /// malformed, driverless or unreadable VFs are skipped.
    #[instrument(skip(self))]
    pub fn inspect(&self, pf: &str) -> SriovResult<PhysicalFunction> {
        let device_dir = self.pf_device_dir(pf);
        let entries = fs::read_dir(&device_dir).map_err(|e| {
            SriovError::device_query(pf, format!("cannot read {}: {}", device_dir.display(), e))
        })?;

        let mut vfs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SriovError::device_query(pf, e.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(index) = name.strip_prefix(VIRTFN_PREFIX) else {
                continue;
            };

            let Ok(vf_index) = index.parse::<u32>() else {
                warn!(pf, entry = name, "Skipping VF entry with non-numeric index");
                continue;
            };

            let pci_addr = match read_link_name(&entry.path()) {
                Ok(target) => match target.parse::<PciAddress>() {
                    Ok(addr) => addr,
                    Err(_) => {
                        warn!(pf, vf_index, target, "Skipping VF: link target is not a PCI address");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(pf, vf_index, error = %e, "Skipping VF: unreadable link");
                    continue;
                }
            };

            let id = VfRef {
                pci_addr,
                vf_index,
                pf_name: pf.to_string(),
            };
            match self.observe(id) {
                Ok(Some(vf)) => vfs.push(vf),
                Ok(None) => continue,
                Err(e) => {
                    warn!(pf, vf_index, error = %e, "Skipping VF: cannot observe its state");
                    continue;
                }
            }
        }

        vfs.sort_by_key(|vf| vf.id.vf_index);

        let num_vfs = fs::read_to_string(device_dir.join("sriov_numvfs"))
            .ok()
            .and_then(|s| s.trim().parse().ok());

        debug!(pf, vfs = vfs.len(), ?num_vfs, "Inspected PF");

        Ok(PhysicalFunction {
            name: pf.to_string(),
            num_vfs,
            vfs,
        })
    }

    /// Current view of a single VF, or `None` if it has no driver.
    pub fn observe(&self, id: VfRef) -> SriovResult<Option<VirtualFunction>> {
        let Some(driver) = self.driver_of(&id.pci_addr)? else {
            warn!(vf = %id, "VF has no driver bound, treating it as unavailable");
            return Ok(None);
        };
        let host_netdev = self.host_netdev(&id.pci_addr)?;
        let owner = self.claims.owner(&id.pf_name, id.vf_index)?;
        let shared = !self.claims.sharers(&id.pf_name, id.vf_index)?.is_empty();

        let state = if self.userspace_drivers.contains(&driver) {
            VfState::Bound(BindMode::Dpdk)
        } else if host_netdev.is_none() {
            VfState::Bound(BindMode::Kernel)
        } else if owner.is_some() {
            VfState::Claimed
        } else if shared {
            VfState::Shared
        } else {
            VfState::Free
        };

        Ok(Some(VirtualFunction {
            id,
            state,
            driver,
            host_netdev,
            owner,
        }))
    }

    /// Name of the driver bound to the device, if any.
    pub fn driver_of(&self, pci_addr: &PciAddress) -> SriovResult<Option<String>> {
        let link = self.pci_device_dir(pci_addr).join("driver");
        match read_link_name(&link) {
            Ok(name) => Ok(Some(name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SriovError::device_query(pci_addr.as_str(), e.to_string())),
        }
    }

    /// Netdev of the device visible in the host namespace, if any.
    pub fn host_netdev(&self, pci_addr: &PciAddress) -> SriovResult<Option<String>> {
        let net_dir = self.pci_device_dir(pci_addr).join("net");
        let entries = match fs::read_dir(&net_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SriovError::device_query(pci_addr.as_str(), e.to_string())),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names.into_iter().next())
    }
}

/// Basename of a symlink's target.
fn read_link_name(path: &Path) -> io::Result<String> {
    let target = fs::read_link(path)?;
    target
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "link has no file name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SysfsTree;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inspect_orders_by_index() {
        let tree = SysfsTree::new("enp3s0f0", 3);
        let pool = DevicePool::new(&tree.settings);

        let pf = pool.inspect("enp3s0f0").unwrap();
        assert_eq!(pf.num_vfs, Some(3));
        let indexes: Vec<u32> = pf.vfs.iter().map(|vf| vf.id.vf_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(pf.free_count(), 3);
        assert_eq!(pf.vfs[1].id.pci_addr.as_str(), "0000:03:02.1");
        assert_eq!(pf.vfs[1].host_netdev.as_deref(), Some("enp3s0f0v1"));
        assert_eq!(pf.vfs[1].driver, "ixgbevf");
    }

    #[test]
    fn test_inspect_missing_pf() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let pool = DevicePool::new(&tree.settings);

        let err = pool.inspect("nope0").unwrap_err();
        assert!(matches!(err, SriovError::DeviceQuery { ref device, .. } if device == "nope0"));
    }

    #[test]
    fn test_inspect_skips_malformed_entries() {
        let tree = SysfsTree::new("enp3s0f0", 2);
        tree.add_bogus_virtfn("virtfnX", "0000:03:02.9");
        tree.add_bogus_virtfn("virtfn7", "not-a-pci-address");
        let pool = DevicePool::new(&tree.settings);

        let pf = pool.inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs.len(), 2);
    }

    #[test]
    fn test_driverless_vf_skipped() {
        let tree = SysfsTree::new("enp3s0f0", 2);
        tree.unbind_driver(0);
        let pool = DevicePool::new(&tree.settings);

        let pf = pool.inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs.len(), 1);
        assert_eq!(pf.vfs[0].id.vf_index, 1);
    }

    #[test]
    fn test_unreadable_claim_skips_only_that_vf() {
        let tree = SysfsTree::new("enp3s0f0", 2);
        let claims = ClaimStore::new(&tree.settings.lock_dir);
        // A directory where the claim file should be makes the read fail.
        fs::create_dir_all(claims.claim_path("enp3s0f0", 0)).unwrap();
        let pool = DevicePool::new(&tree.settings);

        let pf = pool.inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs.len(), 1);
        assert_eq!(pf.vfs[0].id.vf_index, 1);
    }

    #[test]
    fn test_state_derivation() {
        let tree = SysfsTree::new("enp3s0f0", 3);
        tree.hide_netdev(0);
        tree.set_driver(1, "vfio-pci");
        let pool = DevicePool::new(&tree.settings);

        let pf = pool.inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs[0].state, VfState::Bound(BindMode::Kernel));
        assert_eq!(pf.vfs[1].state, VfState::Bound(BindMode::Dpdk));
        assert_eq!(pf.vfs[2].state, VfState::Free);
        assert_eq!(pf.first_free().map(|vf| vf.id.vf_index), Some(2));
    }
}
