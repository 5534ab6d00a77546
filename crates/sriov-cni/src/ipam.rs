//! Address coordination
//!
//! Runs the configured IPAM plugin with the original request payload and
//! applies what it hands back: addresses and routes on the kernel interface,
//! or a handoff file for a DPDK consumer that has no interface to configure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sriov_cni_common::shell;
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, info, instrument, warn};

use crate::binder::BoundInterface;
use crate::config::NetConf;
use crate::link::LinkOps;
use crate::netns::NetNs;
use crate::record::write_private_file;
use crate::result::{CniError, CniResult, IpConfig};
use crate::types::BindMode;

/// Suffix of the DPDK handoff file.
pub const HANDOFF_SUFFIX: &str = "ipam";

/// CNI environment handed to the IPAM plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamEnv {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    /// Directories searched for the plugin executable
    pub path: Vec<PathBuf>,
}

impl IpamEnv {
    fn vars(&self, command: &str) -> Vec<(&'static str, String)> {
        let path = self
            .path
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        vec![
            ("CNI_COMMAND", command.to_string()),
            ("CNI_CONTAINERID", self.container_id.clone()),
            ("CNI_NETNS", self.netns.clone()),
            ("CNI_IFNAME", self.ifname.clone()),
            ("CNI_ARGS", self.args.clone()),
            ("CNI_PATH", path),
        ]
    }
}

/// The external address-management plugin
#[async_trait]
pub trait IpamBackend: Send + Sync {
    async fn add(&self, plugin: &str, payload: &[u8], env: &IpamEnv) -> SriovResult<CniResult>;

    async fn del(&self, plugin: &str, payload: &[u8], env: &IpamEnv) -> SriovResult<()>;
}

/// [`IpamBackend`] that executes the plugin binary from `CNI_PATH`
#[derive(Debug, Clone, Default)]
pub struct ExecIpam;

impl ExecIpam {
    pub fn new() -> Self {
        Self
    }

    fn find(plugin: &str, env: &IpamEnv) -> SriovResult<PathBuf> {
        if plugin.contains('/') {
            return Err(SriovError::address_backend(plugin, "invalid plugin name"));
        }
        env.path
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                SriovError::address_backend(
                    plugin,
                    format!("executable not found in CNI_PATH {:?}", env.path),
                )
            })
    }

    async fn exec(
        &self,
        plugin: &str,
        command: &str,
        payload: &[u8],
        env: &IpamEnv,
    ) -> SriovResult<String> {
        let program = Self::find(plugin, env)?;
        let result = shell::run(&program, env.vars(command), payload)
            .await
            .map_err(|e| SriovError::address_backend(plugin, e.to_string()))?;

        if result.success() {
            return Ok(result.stdout);
        }

        // Plugins report failures as a CNI error object on stdout.
        match serde_json::from_str::<CniError>(&result.stdout) {
            Ok(err) => Err(SriovError::AddressBackend {
                plugin: plugin.to_string(),
                code: Some(err.code),
                message: err.msg,
            }),
            Err(_) => Err(SriovError::address_backend(
                plugin,
                format!(
                    "exited with {}: {}",
                    result.exit_code,
                    result.combined_output().trim()
                ),
            )),
        }
    }
}

#[async_trait]
impl IpamBackend for ExecIpam {
    async fn add(&self, plugin: &str, payload: &[u8], env: &IpamEnv) -> SriovResult<CniResult> {
        let stdout = self.exec(plugin, "ADD", payload, env).await?;
        CniResult::from_ipam_output(plugin, &stdout)
    }

    async fn del(&self, plugin: &str, payload: &[u8], env: &IpamEnv) -> SriovResult<()> {
        self.exec(plugin, "DEL", payload, env).await?;
        Ok(())
    }
}

/// Path of the DPDK handoff file for an attachment.
pub fn handoff_path(cni_dir: &Path, container_id: &str, ifname: &str) -> PathBuf {
    cni_dir.join(format!("{}-{}-{}", container_id, ifname, HANDOFF_SUFFIX))
}

pub struct AddressCoordinator {
    ipam: Arc<dyn IpamBackend>,
    links: Arc<dyn LinkOps>,
}

impl AddressCoordinator {
    pub fn new(ipam: Arc<dyn IpamBackend>, links: Arc<dyn LinkOps>) -> Self {
        Self { ipam, links }
    }

    /// Obtains addresses for a bound interface and applies them.
    ///
    /// Returns `Ok(None)` when the descriptor has no address management.
    #[instrument(skip_all, fields(container_id = %env.container_id, ifname = %bound.ifname))]
    pub async fn apply(
        &self,
        conf: &NetConf,
        payload: &[u8],
        env: &IpamEnv,
        bound: &BoundInterface,
        ns: &NetNs,
        cni_dir: &Path,
    ) -> SriovResult<Option<CniResult>> {
        let Some(plugin) = conf.ipam_plugin() else {
            return Ok(None);
        };

        let mut result = self.ipam.add(plugin, payload, env).await?;
        result.cni_version = conf.cni_version.clone();
        if !conf.dns.is_empty() {
            result.dns = conf.dns.clone();
        }

        if bound.mode == BindMode::Dpdk {
            let path = handoff_path(cni_dir, &env.container_id, &bound.ifname);
            write_private_file(&path, result.to_json()?.as_bytes())?;
            info!(path = %path.display(), "Wrote IPAM handoff file");
            return Ok(Some(result));
        }

        let Some(ip4) = result.ip4.as_ref() else {
            return Err(SriovError::AddressConfigMissing {
                plugin: plugin.to_string(),
            });
        };
        self.configure(ns, &bound.ifname, ip4).await?;
        if let Some(ip6) = result.ip6.as_ref() {
            self.configure(ns, &bound.ifname, ip6).await?;
        }
        info!(address = %ip4.ip, "Applied IPAM result");
        Ok(Some(result))
    }

    async fn configure(&self, ns: &NetNs, ifname: &str, config: &IpConfig) -> SriovResult<()> {
        self.links.add_address(Some(ns), ifname, &config.ip).await?;
        for route in &config.routes {
            let gw = route.gw.or(config.gateway);
            debug!(dst = %route.dst, ?gw, "Adding route");
            self.links.add_route(Some(ns), ifname, &route.dst, gw).await?;
        }
        Ok(())
    }

    /// Returns the attachment's addresses to the IPAM plugin. A descriptor
    /// without address management is a no-op.
    #[instrument(skip_all, fields(container_id = %env.container_id))]
    pub async fn release(&self, conf: &NetConf, payload: &[u8], env: &IpamEnv) -> SriovResult<()> {
        let Some(plugin) = conf.ipam_plugin() else {
            return Ok(());
        };
        match self.ipam.del(plugin, payload, env).await {
            Ok(()) => {
                debug!(plugin, "Released IPAM allocation");
                Ok(())
            }
            Err(e) => {
                warn!(plugin, error = %e, "IPAM release failed");
                Err(e)
            }
        }
    }
}
