//! Test fixtures for SR-IOV attachment scenarios
//!
//! Provides a fake node (sysfs tree, lock and state directories, namespace
//! files) and descriptor builders for the common attachment modes.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use sriov_cni::{CniRequest, PluginSettings};
use tempfile::TempDir;

/// Kernel driver the fake VFs start on
pub const KERNEL_DRIVER: &str = "ixgbevf";

/// A throwaway node with one SR-IOV PF
pub struct FakeNode {
    _dir: TempDir,
    pub root: PathBuf,
    pub pf: String,
    pub settings: PluginSettings,
}

impl FakeNode {
    /// A PF named `pf` with `num_vfs` VFs on the kernel driver, each with a
    /// host netdev `<pf>v<N>`.
    pub fn new(pf: &str, num_vfs: u32) -> Self {
        let dir = tempfile::tempdir().expect("create node dir");
        let root = dir.path().to_path_buf();
        let sysfs = root.join("sys");

        let device_dir = sysfs.join("class/net").join(pf).join("device");
        fs::create_dir_all(&device_dir).expect("create PF device dir");
        fs::write(device_dir.join("sriov_numvfs"), format!("{}\n", num_vfs))
            .expect("write sriov_numvfs");
        fs::create_dir_all(root.join("netns")).expect("create netns dir");

        let settings = PluginSettings {
            sysfs_root: sysfs,
            lock_dir: root.join("run/sriov-cni"),
            default_cni_dir: root.join("var/lib/cni/sriov"),
            ..PluginSettings::default()
        };

        let node = Self {
            _dir: dir,
            root,
            pf: pf.to_string(),
            settings,
        };
        for index in 0..num_vfs {
            node.add_vf(index);
        }
        node
    }

    /// PCI address of VF `index`
    pub fn pci_addr(index: u32) -> String {
        format!("0000:03:{:02x}.{}", 2 + index / 8, index % 8)
    }

    /// Host netdev name VF `index` starts with
    pub fn vf_netdev(&self, index: u32) -> String {
        format!("{}v{}", self.pf, index)
    }

    pub fn sysfs(&self) -> &Path {
        &self.settings.sysfs_root
    }

    pub fn pci_dir(&self, pci_addr: &str) -> PathBuf {
        self.sysfs().join("bus/pci/devices").join(pci_addr)
    }

    fn add_vf(&self, index: u32) {
        let pci_addr = Self::pci_addr(index);
        let pci_dir = self.pci_dir(&pci_addr);
        fs::create_dir_all(pci_dir.join("net").join(self.vf_netdev(index)))
            .expect("create VF netdev dir");
        self.set_driver(&pci_addr, KERNEL_DRIVER);
        symlink(
            &pci_dir,
            self.sysfs()
                .join("class/net")
                .join(&self.pf)
                .join("device")
                .join(format!("virtfn{}", index)),
        )
        .expect("create virtfn link");
    }

    /// Points the VF's `driver` link at `driver`.
    pub fn set_driver(&self, pci_addr: &str, driver: &str) {
        let driver_dir = self.sysfs().join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&driver_dir).expect("create driver dir");
        let link = self.pci_dir(pci_addr).join("driver");
        let _ = fs::remove_file(&link);
        symlink(driver_dir, link).expect("create driver link");
    }

    /// Creates a namespace handle file and returns its path.
    pub fn namespace(&self, name: &str) -> PathBuf {
        let path = self.root.join("netns").join(name);
        fs::write(&path, b"").expect("create namespace file");
        path
    }

    /// Working directory for records and handoff files
    pub fn cni_dir(&self) -> PathBuf {
        self.settings.default_cni_dir.clone()
    }

    /// A request as the runtime would send it.
    pub fn request(
        &self,
        container_id: &str,
        netns: Option<&Path>,
        ifname: &str,
        payload: &str,
    ) -> CniRequest {
        CniRequest {
            container_id: container_id.to_string(),
            netns: netns.map(Path::to_path_buf),
            ifname: ifname.to_string(),
            args: String::new(),
            path: vec![self.root.join("opt/cni/bin")],
            payload: payload.as_bytes().to_vec(),
        }
    }
}

/// Descriptor builders for each attachment mode
pub mod netconf_fixtures {
    use serde_json::json;

    /// Kernel mode with host-local style IPAM
    pub fn kernel(pf: &str) -> String {
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-net",
            "type": "sriov",
            "master": pf,
            "ipam": {"type": "host-local", "subnet": "10.56.217.0/24"},
            "dns": {"nameservers": ["10.56.217.1"]}
        })
        .to_string()
    }

    /// Kernel mode with a VLAN tag on the VF
    pub fn kernel_vlan(pf: &str, vlan: u16) -> String {
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-net",
            "type": "sriov",
            "master": pf,
            "vlan": vlan,
            "l2enable": true
        })
        .to_string()
    }

    /// Link-layer only, no IPAM step
    pub fn l2(pf: &str) -> String {
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-l2",
            "type": "sriov",
            "master": pf,
            "l2enable": true
        })
        .to_string()
    }

    /// Shared VF; `l2enable` selects whether it is legal
    pub fn shared(pf: &str, l2enable: bool) -> String {
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-shared",
            "type": "sriov",
            "master": pf,
            "sharedvf": true,
            "l2enable": l2enable
        })
        .to_string()
    }

    /// DPDK mode with IPAM and DNS, writing the handoff file
    pub fn dpdk(pf: &str) -> String {
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-dpdk",
            "type": "sriov",
            "master": pf,
            "dpdk": {"dpdk_driver": "vfio-pci"},
            "ipam": {"type": "host-local", "subnet": "10.56.218.0/24"},
            "dns": {"nameservers": ["10.56.218.1"], "search": ["svc.local"]}
        })
        .to_string()
    }

    /// Explicit device override; `None` drops the field.
    pub fn device_override(
        pci_addr: Option<&str>,
        vfid: Option<u32>,
        pfname: Option<&str>,
    ) -> String {
        let mut info = serde_json::Map::new();
        if let Some(pci_addr) = pci_addr {
            info.insert("pci_addr".into(), json!(pci_addr));
        }
        if let Some(vfid) = vfid {
            info.insert("vfid".into(), json!(vfid));
        }
        if let Some(pfname) = pfname {
            info.insert("pfname".into(), json!(pfname));
        }
        json!({
            "cniVersion": "0.2.0",
            "name": "sriov-override",
            "type": "sriov",
            "deviceinfo": info,
            "l2enable": true
        })
        .to_string()
    }
}
