//! SR-IOV device type definitions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sriov_cni_common::SriovError;

/// PCI address in extended bus/device/function form (`0000:03:02.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    /// Returns the address as it appears under `/sys/bus/pci/devices`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PciAddress {
    type Err = SriovError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SriovError::config("pci_addr", format!("'{}' is not a PCI address", s));

        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let hex_of_len = |part: &str, len: usize| {
            part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit())
        };
        if !hex_of_len(domain, 4)
            || !hex_of_len(bus, 2)
            || !hex_of_len(device, 2)
            || !hex_of_len(function, 1)
        {
            return Err(invalid());
        }

        Ok(PciAddress(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = SriovError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(value: PciAddress) -> Self {
        value.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a VF is attached to its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// The VF netdev lives in a container namespace.
    Kernel,
    /// A macvlan child of the VF netdev lives in a container namespace.
    Shared,
    /// The VF is bound to a userspace I/O driver.
    Dpdk,
}

/// Allocation state of a VF, derived from device and driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfState {
    /// Netdev visible in the host namespace and nobody holds a claim.
    Free,
    /// A claim record exists but the VF has not left the host yet.
    Claimed,
    /// Parent of shared-mode links; stays in the host, never handed out
    /// exclusively.
    Shared,
    /// Attached to a consumer.
    Bound(BindMode),
}

impl VfState {
    /// Check if the VF can be handed out
    pub fn is_free(&self) -> bool {
        matches!(self, VfState::Free)
    }
}

/// Identity of a VF: everything needed to find it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfRef {
    /// PCI address of the VF
    pub pci_addr: PciAddress,
    /// Index of the VF within its PF
    pub vf_index: u32,
    /// Name of the owning PF
    pub pf_name: String,
}

impl fmt::Display for VfRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vf{} ({})", self.pf_name, self.vf_index, self.pci_addr)
    }
}

/// A VF as observed in the device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    /// VF identity
    pub id: VfRef,

    /// Current allocation state
    pub state: VfState,

    /// Driver currently bound to the VF
    pub driver: String,

    /// Netdev name in the host namespace, if the VF has one there
    pub host_netdev: Option<String>,

    /// Container holding the claim, if any
    pub owner: Option<String>,
}

/// A PF and its VFs, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalFunction {
    /// Host netdev name of the PF
    pub name: String,

    /// Value of `sriov_numvfs`, when readable
    pub num_vfs: Option<u32>,

    /// Usable VFs ordered by index
    pub vfs: Vec<VirtualFunction>,
}

impl PhysicalFunction {
    /// Number of VFs that can currently be allocated
    pub fn free_count(&self) -> usize {
        self.vfs.iter().filter(|vf| vf.state.is_free()).count()
    }

    /// First free VF in index order
    pub fn first_free(&self) -> Option<&VirtualFunction> {
        self.vfs.iter().find(|vf| vf.state.is_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pci_address_parse() {
        let addr: PciAddress = "0000:03:02.1".parse().unwrap();
        assert_eq!(addr.as_str(), "0000:03:02.1");

        let upper: PciAddress = "0000:AF:00.7".parse().unwrap();
        assert_eq!(upper.to_string(), "0000:af:00.7");
    }

    #[test]
    fn test_pci_address_rejects_garbage() {
        assert!("03:02.1".parse::<PciAddress>().is_err());
        assert!("0000:03:02".parse::<PciAddress>().is_err());
        assert!("0000:03:02.10".parse::<PciAddress>().is_err());
        assert!("zzzz:03:02.1".parse::<PciAddress>().is_err());
        assert!("".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_pci_address_serde() {
        let addr: PciAddress = serde_json::from_str("\"0000:03:02.0\"").unwrap();
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"0000:03:02.0\"");
        assert!(serde_json::from_str::<PciAddress>("\"bogus\"").is_err());
    }

    #[test]
    fn test_vf_state_is_free() {
        assert!(VfState::Free.is_free());
        assert!(!VfState::Claimed.is_free());
        assert!(!VfState::Shared.is_free());
        assert!(!VfState::Bound(BindMode::Dpdk).is_free());
    }

    #[test]
    fn test_bind_mode_serde() {
        assert_eq!(serde_json::to_string(&BindMode::Dpdk).unwrap(), "\"dpdk\"");
    }
}
