//! Network attachment descriptor and plugin settings.
//!
//! The descriptor (`NetConf`) arrives as JSON on stdin for every invocation.
//! The plugin settings (`PluginSettings`) are node-wide and loaded from a
//! TOML file, by default `/etc/cni/sriov-cni.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sriov_cni_common::{SriovError, SriovResult};

use crate::result::{Dns, CNI_VERSION, SUPPORTED_VERSIONS};
use crate::types::{BindMode, PciAddress, VfRef};

/// Default settings file location.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/cni/sriov-cni.toml";

/// Environment variable overriding the settings file location.
pub const SETTINGS_PATH_ENV: &str = "SRIOV_CNI_CONFIG";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

const MAX_VLAN_ID: u16 = 4095;

/// Explicit device override.
///
/// Every field is optional on the wire so an incomplete override can be
/// reported with the names of all missing fields at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pfname: Option<String>,
}

impl DeviceInfo {
    /// Turns the override into a VF identity.
    pub fn resolve(&self) -> SriovResult<VfRef> {
        let pci_addr = self.pci_addr.as_deref().filter(|s| !s.is_empty());
        let pf_name = self.pfname.as_deref().filter(|s| !s.is_empty());

        let mut missing = Vec::new();
        if pci_addr.is_none() {
            missing.push("pci_addr");
        }
        if self.vfid.is_none() {
            missing.push("vfid");
        }
        if pf_name.is_none() {
            missing.push("pfname");
        }

        match (pci_addr, self.vfid, pf_name) {
            (Some(pci_addr), Some(vf_index), Some(pf_name)) => Ok(VfRef {
                pci_addr: pci_addr.parse::<PciAddress>()?,
                vf_index,
                pf_name: pf_name.to_string(),
            }),
            _ => Err(SriovError::DeviceMissingFields {
                missing: missing.join(", "),
            }),
        }
    }
}

/// Userspace driver parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpdkConf {
    /// Kernel driver to restore on teardown; defaults to whatever the VF
    /// was bound to before the attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_driver: Option<String>,

    /// Userspace I/O driver, e.g. `vfio-pci`.
    #[serde(default)]
    pub dpdk_driver: String,

    /// External bind helper (`dpdk-devbind.py`). Sysfs is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpdk_tool: Option<PathBuf>,
}

/// IPAM block. Only the plugin type is interpreted; the backend receives
/// the whole descriptor on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
}

/// Network attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default = "default_cni_version")]
    pub cni_version: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// PF to allocate from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviceinfo: Option<DeviceInfo>,

    /// Interface name inside the namespace, overriding `CNI_IFNAME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if0name: Option<String>,

    #[serde(default)]
    pub l2enable: bool,

    #[serde(default)]
    pub sharedvf: bool,

    #[serde(default)]
    pub vlan: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpdk: Option<DpdkConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,

    #[serde(default)]
    pub dns: Dns,

    #[serde(rename = "cniDir", default, skip_serializing_if = "Option::is_none")]
    pub cni_dir: Option<PathBuf>,
}

fn default_cni_version() -> String {
    CNI_VERSION.to_string()
}

impl NetConf {
    /// Decodes and validates a descriptor read from stdin.
    pub fn parse(bytes: &[u8]) -> SriovResult<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| SriovError::config("netconf", e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Structural validation. Does not look at any device.
    pub fn validate(&self) -> SriovResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.cni_version.as_str()) {
            return Err(SriovError::config(
                "cniVersion",
                format!("unsupported version '{}'", self.cni_version),
            ));
        }

        let has_master = self.master.as_deref().is_some_and(|m| !m.is_empty());
        if !has_master && self.deviceinfo.is_none() {
            return Err(SriovError::config(
                "master",
                "either master or deviceinfo is required",
            ));
        }

        if let Some(ifname) = self.if0name.as_deref().filter(|name| !name.is_empty()) {
            validate_ifname(ifname)?;
        }

        if self.vlan > MAX_VLAN_ID {
            return Err(SriovError::config(
                "vlan",
                format!("{} is out of range 0-{}", self.vlan, MAX_VLAN_ID),
            ));
        }

        if let Some(dpdk) = &self.dpdk {
            if dpdk.dpdk_driver.is_empty() {
                return Err(SriovError::config("dpdk.dpdk_driver", "must be set"));
            }
        }

        Ok(())
    }

    /// Rejects shared-VF mode without link-layer-only mode.
    pub fn check_shared_mode(&self) -> SriovResult<()> {
        if self.sharedvf && !self.l2enable {
            return Err(SriovError::config(
                "sharedvf",
                "shared VF mode requires l2enable",
            ));
        }
        Ok(())
    }

    pub fn bind_mode(&self) -> BindMode {
        if self.dpdk.is_some() {
            BindMode::Dpdk
        } else if self.sharedvf {
            BindMode::Shared
        } else {
            BindMode::Kernel
        }
    }

    /// Name of the IPAM plugin to run, if addresses are managed at all.
    pub fn ipam_plugin(&self) -> Option<&str> {
        if self.l2enable {
            return None;
        }
        self.ipam
            .as_ref()
            .map(|ipam| ipam.plugin_type.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Effective interface name inside the namespace.
    pub fn interface_name<'a>(&'a self, requested: &'a str) -> &'a str {
        self.if0name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(requested)
    }

    /// Working directory for records and handoff files.
    pub fn cni_dir(&self, settings: &PluginSettings) -> PathBuf {
        self.cni_dir
            .clone()
            .unwrap_or_else(|| settings.default_cni_dir.clone())
    }
}

/// Checks that `name` is usable as a kernel interface name.
pub fn validate_ifname(name: &str) -> SriovResult<()> {
    if name.is_empty() {
        return Err(SriovError::config("ifname", "must not be empty"));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(SriovError::config(
            "ifname",
            format!("'{}' is longer than {} characters", name, MAX_IFNAME_LEN),
        ));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains(char::is_whitespace)
    {
        return Err(SriovError::config(
            "ifname",
            format!("'{}' is not a valid interface name", name),
        ));
    }
    Ok(())
}

/// Checks that a container id can key files under the working directory.
pub fn validate_container_id(id: &str) -> SriovResult<()> {
    if id.is_empty() {
        return Err(SriovError::config("containerID", "must not be empty"));
    }
    if id.contains('/') || id.contains('\0') || id == "." || id == ".." {
        return Err(SriovError::config(
            "containerID",
            format!("'{}' is not a valid container id", id),
        ));
    }
    Ok(())
}

/// Node-wide plugin settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Root of the sysfs mount
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Directory holding per-PF lock files and claim records
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Working directory used when the descriptor has no `cniDir`
    #[serde(default = "default_cni_dir")]
    pub default_cni_dir: PathBuf,

    /// Drivers that mark a VF as bound to a userspace dataplane
    #[serde(default = "default_userspace_drivers")]
    pub userspace_drivers: Vec<String>,

    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/sriov-cni")
}

fn default_cni_dir() -> PathBuf {
    PathBuf::from("/var/lib/cni/sriov")
}

fn default_userspace_drivers() -> Vec<String> {
    vec![
        "vfio-pci".to_string(),
        "igb_uio".to_string(),
        "uio_pci_generic".to_string(),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            lock_dir: default_lock_dir(),
            default_cni_dir: default_cni_dir(),
            userspace_drivers: default_userspace_drivers(),
            log_level: default_log_level(),
        }
    }
}

impl PluginSettings {
    /// Load settings from file, falling back to defaults if the file is absent
    pub fn load_or_default(path: impl AsRef<Path>) -> SriovResult<Self> {
        let path = path.as_ref();

        let settings: Self = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                SriovError::config(
                    "settings",
                    format!("failed to parse {}: {}", path.display(), e),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(SriovError::io(path, e)),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> SriovResult<()> {
        for (field, path) in [
            ("sysfs_root", &self.sysfs_root),
            ("lock_dir", &self.lock_dir),
            ("default_cni_dir", &self.default_cni_dir),
        ] {
            if !path.is_absolute() {
                return Err(SriovError::config(
                    field,
                    format!("{} is not an absolute path", path.display()),
                ));
            }
        }

        if self.userspace_drivers.iter().any(|d| d.is_empty()) {
            return Err(SriovError::config(
                "userspace_drivers",
                "driver names must not be empty",
            ));
        }

        Ok(())
    }
}
