//! CNI result and error payloads.
//!
//! The plugin speaks the 0.2.0 result format (`ip4`/`ip6`/`dns`), which is
//! also what IPAM plugins of that generation return, and adds an
//! `interfaces` list naming the attached device.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sriov_cni_common::{SriovError, SriovResult};

/// CNI version spoken by default.
pub const CNI_VERSION: &str = "0.2.0";

/// CNI versions this plugin accepts.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0"];

/// DNS settings passed through to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// A route to install alongside an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Address configuration for one address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// The interface an attachment produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
}

/// Result of an ADD, as printed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default = "default_version")]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<IpConfig>,
    #[serde(default)]
    pub dns: Dns,
}

fn default_version() -> String {
    CNI_VERSION.to_string()
}

impl CniResult {
    /// A result carrying no address configuration at all.
    ///
    /// Link-layer-only attachments return this instead of nothing so the
    /// runtime always receives a well-formed object.
    pub fn empty(cni_version: impl Into<String>) -> Self {
        Self {
            cni_version: cni_version.into(),
            interfaces: Vec::new(),
            ip4: None,
            ip6: None,
            dns: Dns::default(),
        }
    }

    /// Parses the stdout of an IPAM plugin.
    pub fn from_ipam_output(plugin: &str, stdout: &str) -> SriovResult<Self> {
        serde_json::from_str(stdout).map_err(|e| {
            SriovError::address_backend(plugin, format!("undecodable result: {}", e))
        })
    }

    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn to_json(&self) -> SriovResult<String> {
        serde_json::to_string(self).map_err(|e| SriovError::serialization("CNI result", e))
    }
}

/// Error object printed to the runtime when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    #[serde(default = "default_version")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn from_error(cni_version: impl Into<String>, err: &SriovError) -> Self {
        let details = std::error::Error::source(err)
            .map(|source| source.to_string())
            .unwrap_or_default();
        Self {
            cni_version: cni_version.into(),
            code: err.code(),
            msg: err.to_string(),
            details,
        }
    }
}

/// Answer to the VERSION command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: &'static str,
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CNI_VERSION,
            supported_versions: SUPPORTED_VERSIONS,
        }
    }
}
