//! Minimal sysfs tree for unit tests.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::config::PluginSettings;

pub(crate) const KERNEL_DRIVER: &str = "ixgbevf";

pub(crate) struct SysfsTree {
    _dir: TempDir,
    pub root: PathBuf,
    pub pf: String,
    pub settings: PluginSettings,
}

impl SysfsTree {
    /// A PF named `pf` with `num_vfs` VFs bound to the kernel driver, each
    /// with a host netdev `<pf>v<N>`.
    pub fn new(pf: &str, num_vfs: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let sys = root.join("sys");

        let device_dir = sys.join("class/net").join(pf).join("device");
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(device_dir.join("sriov_numvfs"), format!("{}\n", num_vfs)).unwrap();
        fs::create_dir_all(sys.join("bus/pci/drivers").join(KERNEL_DRIVER)).unwrap();

        let settings = PluginSettings {
            sysfs_root: sys,
            lock_dir: root.join("run"),
            default_cni_dir: root.join("cni"),
            ..PluginSettings::default()
        };

        let tree = Self {
            _dir: dir,
            root,
            pf: pf.to_string(),
            settings,
        };
        for index in 0..num_vfs {
            tree.add_vf(index);
        }
        tree
    }

    pub fn pci_addr(index: u32) -> String {
        format!("0000:03:{:02x}.{}", 2 + index / 8, index % 8)
    }

    fn pci_dir(&self, index: u32) -> PathBuf {
        self.settings
            .sysfs_root
            .join("bus/pci/devices")
            .join(Self::pci_addr(index))
    }

    fn add_vf(&self, index: u32) {
        let pci_dir = self.pci_dir(index);
        fs::create_dir_all(pci_dir.join("net").join(format!("{}v{}", self.pf, index))).unwrap();
        self.set_driver(index, KERNEL_DRIVER);
        symlink(
            &pci_dir,
            self.settings
                .sysfs_root
                .join("class/net")
                .join(&self.pf)
                .join("device")
                .join(format!("virtfn{}", index)),
        )
        .unwrap();
    }

    pub fn add_bogus_virtfn(&self, name: &str, target: &str) {
        let device_dir = self.settings.sysfs_root.join("class/net").join(&self.pf).join("device");
        symlink(self.root.join(target), device_dir.join(name)).unwrap();
    }

    pub fn set_driver(&self, index: u32, driver: &str) {
        let drivers = self.settings.sysfs_root.join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&drivers).unwrap();
        let link = self.pci_dir(index).join("driver");
        let _ = fs::remove_file(&link);
        symlink(drivers, link).unwrap();
    }

    pub fn unbind_driver(&self, index: u32) {
        fs::remove_file(self.pci_dir(index).join("driver")).unwrap();
    }

    pub fn hide_netdev(&self, index: u32) {
        fs::remove_dir_all(self.pci_dir(index).join("net")).unwrap();
    }
}
