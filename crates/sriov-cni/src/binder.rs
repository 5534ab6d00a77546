//! Interface binder
//!
//! Hands a VF to its consumer and takes it back:
//!
//! - kernel mode moves the VF netdev into the container namespace and
//!   renames it there
//! - shared mode leaves the VF in the host and moves a macvlan child instead
//! - DPDK mode rebinds the VF to a userspace I/O driver
//!
//! A failure partway through a bind undoes the completed steps before the
//! error is returned. Unbind is best-effort except for the driver rebind.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, info, instrument, warn};

use crate::config::{DpdkConf, NetConf};
use crate::driver::DriverOps;
use crate::inspector::DevicePool;
use crate::link::LinkOps;
use crate::netns::NetNs;
use crate::types::{BindMode, VfRef};

/// Everything needed to reverse a bind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundInterface {
    pub vf: VfRef,

    pub mode: BindMode,

    /// Interface name requested for the container
    pub ifname: String,

    /// Host netdev of the VF before the bind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ifname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<PathBuf>,

    /// VLAN programmed on the VF, 0 for none
    #[serde(default)]
    pub vlan: u16,

    /// Kernel driver to restore (DPDK mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_driver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpdk_driver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpdk_tool: Option<PathBuf>,
}

/// Completed kernel-mode steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelStep {
    Vlan,
    Moved,
    Renamed,
}

/// Completed shared-mode steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SharedStep {
    Created,
    Moved,
    Renamed,
}

pub struct InterfaceBinder {
    pool: DevicePool,
    links: Arc<dyn LinkOps>,
    drivers: Arc<dyn DriverOps>,
}

impl InterfaceBinder {
    pub fn new(pool: DevicePool, links: Arc<dyn LinkOps>, drivers: Arc<dyn DriverOps>) -> Self {
        Self {
            pool,
            links,
            drivers,
        }
    }

    /// Attaches `vf` to the container as `ifname`.
    #[instrument(skip(self, conf, vf, ns), fields(vf = %vf, mode = ?conf.bind_mode()))]
    pub async fn bind(
        &self,
        conf: &NetConf,
        vf: &VfRef,
        container_id: &str,
        ifname: &str,
        ns: &NetNs,
    ) -> SriovResult<BoundInterface> {
        let bound = match (conf.bind_mode(), &conf.dpdk) {
            (BindMode::Dpdk, Some(dpdk)) => self.bind_dpdk(dpdk, vf, ifname).await?,
            (BindMode::Shared, _) => self.bind_shared(vf, container_id, ifname, ns).await?,
            _ => self.bind_kernel(vf, conf.vlan, ifname, ns).await?,
        };
        info!(ifname, "VF bound");
        Ok(bound)
    }

    async fn bind_kernel(
        &self,
        vf: &VfRef,
        vlan: u16,
        ifname: &str,
        ns: &NetNs,
    ) -> SriovResult<BoundInterface> {
        let host_ifname = self.host_ifname(vf)?;

        let mut done = Vec::new();
        let result: SriovResult<()> = async {
            if vlan != 0 {
                self.links
                    .set_vf_vlan(&vf.pf_name, vf.vf_index, vlan)
                    .await?;
                done.push(KernelStep::Vlan);
            }
            self.links.set_down(None, &host_ifname).await?;
            self.links.move_to(None, &host_ifname, Some(ns)).await?;
            done.push(KernelStep::Moved);
            self.links.rename(Some(ns), &host_ifname, ifname).await?;
            done.push(KernelStep::Renamed);
            self.links.set_up(Some(ns), ifname).await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, steps = ?done, "Kernel bind failed, undoing");
            self.undo_kernel(vf, &host_ifname, ifname, ns, &done).await;
            return Err(as_bind_error(ifname, e));
        }

        Ok(BoundInterface {
            vf: vf.clone(),
            mode: BindMode::Kernel,
            ifname: ifname.to_string(),
            host_ifname: Some(host_ifname),
            netns: Some(ns.path().to_path_buf()),
            vlan,
            kernel_driver: None,
            dpdk_driver: None,
            dpdk_tool: None,
        })
    }

    async fn undo_kernel(
        &self,
        vf: &VfRef,
        host_ifname: &str,
        ifname: &str,
        ns: &NetNs,
        done: &[KernelStep],
    ) {
        for step in done.iter().rev() {
            let result = match step {
                KernelStep::Renamed => self.links.rename(Some(ns), ifname, host_ifname).await,
                KernelStep::Moved => {
                    if let Err(e) = self.links.set_down(Some(ns), host_ifname).await {
                        debug!(error = %e, "Could not set link down before moving it back");
                    }
                    self.links.move_to(Some(ns), host_ifname, None).await
                }
                KernelStep::Vlan => self.links.set_vf_vlan(&vf.pf_name, vf.vf_index, 0).await,
            };
            if let Err(e) = result {
                warn!(?step, error = %e, "Undo step failed");
            }
        }
    }

    async fn bind_shared(
        &self,
        vf: &VfRef,
        container_id: &str,
        ifname: &str,
        ns: &NetNs,
    ) -> SriovResult<BoundInterface> {
        let parent = self.host_ifname(vf)?;
        let tmp_name = shared_link_name(container_id, ifname);

        let mut done = Vec::new();
        let result: SriovResult<()> = async {
            self.links.add_macvlan(&parent, &tmp_name).await?;
            done.push(SharedStep::Created);
            self.links.move_to(None, &tmp_name, Some(ns)).await?;
            done.push(SharedStep::Moved);
            self.links.rename(Some(ns), &tmp_name, ifname).await?;
            done.push(SharedStep::Renamed);
            self.links.set_up(Some(ns), ifname).await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, steps = ?done, "Shared bind failed, undoing");
            let undo = match done.last() {
                Some(SharedStep::Renamed) => Some((Some(ns), ifname)),
                Some(SharedStep::Moved) => Some((Some(ns), tmp_name.as_str())),
                Some(SharedStep::Created) => Some((None, tmp_name.as_str())),
                None => None,
            };
            if let Some((netns, name)) = undo {
                if let Err(e) = self.links.delete(netns, name).await {
                    warn!(link = name, error = %e, "Failed to delete shared link");
                }
            }
            return Err(as_bind_error(ifname, e));
        }

        Ok(BoundInterface {
            vf: vf.clone(),
            mode: BindMode::Shared,
            ifname: ifname.to_string(),
            host_ifname: Some(parent),
            netns: Some(ns.path().to_path_buf()),
            vlan: 0,
            kernel_driver: None,
            dpdk_driver: None,
            dpdk_tool: None,
        })
    }

    async fn bind_dpdk(
        &self,
        dpdk: &DpdkConf,
        vf: &VfRef,
        ifname: &str,
    ) -> SriovResult<BoundInterface> {
        let current = self.drivers.current(&vf.pci_addr).await?;
        let kernel_driver = dpdk
            .kernel_driver
            .clone()
            .or_else(|| current.filter(|d| *d != dpdk.dpdk_driver))
            .ok_or_else(|| {
                SriovError::driver_bind(
                    vf.pci_addr.as_str(),
                    &dpdk.dpdk_driver,
                    "no kernel driver to restore on teardown",
                )
            })?;
        let host_ifname = self.pool.host_netdev(&vf.pci_addr)?;
        let tool = dpdk.dpdk_tool.as_deref();

        if let Err(e) = self
            .drivers
            .bind(&vf.pci_addr, &dpdk.dpdk_driver, tool)
            .await
        {
            warn!(error = %e, "Userspace driver bind failed, restoring kernel driver");
            if let Err(undo) = self.drivers.bind(&vf.pci_addr, &kernel_driver, tool).await {
                warn!(error = %undo, "Failed to restore kernel driver");
            }
            return Err(e);
        }

        Ok(BoundInterface {
            vf: vf.clone(),
            mode: BindMode::Dpdk,
            ifname: ifname.to_string(),
            host_ifname,
            netns: None,
            vlan: 0,
            kernel_driver: Some(kernel_driver),
            dpdk_driver: Some(dpdk.dpdk_driver.clone()),
            dpdk_tool: dpdk.dpdk_tool.clone(),
        })
    }

    /// Reverses a bind.
    ///
    /// `ns` is `None` when the container namespace is gone. Only a failed
    /// kernel driver rebind is reported as an error.
    #[instrument(skip(self, bound, ns), fields(vf = %bound.vf, mode = ?bound.mode))]
    pub async fn unbind(&self, bound: &BoundInterface, ns: Option<&NetNs>) -> SriovResult<()> {
        match bound.mode {
            BindMode::Kernel => self.unbind_kernel(bound, ns).await,
            BindMode::Shared => {
                if let Some(ns) = ns {
                    self.delete_if_present(ns, &bound.ifname).await;
                }
            }
            BindMode::Dpdk => self.unbind_dpdk(bound).await?,
        }
        info!("VF unbound");
        Ok(())
    }

    async fn unbind_kernel(&self, bound: &BoundInterface, ns: Option<&NetNs>) {
        let Some(host_ifname) = bound.host_ifname.as_deref() else {
            warn!("Attachment has no host interface name, nothing to restore");
            return;
        };

        if let Some(ns) = ns {
            match self.links.exists(Some(ns), &bound.ifname).await {
                Ok(true) => self.return_to_host(ns, &bound.ifname, host_ifname).await,
                Ok(false) => debug!(ifname = %bound.ifname, "Interface not in namespace"),
                Err(e) => warn!(error = %e, "Failed to look up interface in namespace"),
            }
        }

        // After the namespace was destroyed the kernel returns the VF to the
        // host under whatever name it had inside.
        match self.pool.host_netdev(&bound.vf.pci_addr) {
            Ok(Some(current)) if current != host_ifname => {
                if let Err(e) = self.links.rename(None, &current, host_ifname).await {
                    warn!(current = %current, error = %e, "Failed to restore host name");
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => warn!("VF netdev is not back in the host namespace"),
            Err(e) => warn!(error = %e, "Failed to look up VF netdev"),
        }

        if bound.vlan != 0 {
            if let Err(e) = self
                .links
                .set_vf_vlan(&bound.vf.pf_name, bound.vf.vf_index, 0)
                .await
            {
                warn!(error = %e, "Failed to clear VF VLAN");
            }
        }
    }

    async fn return_to_host(&self, ns: &NetNs, ifname: &str, host_ifname: &str) {
        if let Err(e) = self.links.set_down(Some(ns), ifname).await {
            warn!(error = %e, "Failed to set interface down");
        }
        let name = match self.links.rename(Some(ns), ifname, host_ifname).await {
            Ok(()) => host_ifname,
            Err(e) => {
                warn!(error = %e, "Failed to restore original name inside namespace");
                ifname
            }
        };
        if let Err(e) = self.links.move_to(Some(ns), name, None).await {
            warn!(error = %e, "Failed to move interface back to host");
        }
    }

    async fn delete_if_present(&self, ns: &NetNs, ifname: &str) {
        match self.links.exists(Some(ns), ifname).await {
            Ok(true) => {
                if let Err(e) = self.links.delete(Some(ns), ifname).await {
                    warn!(ifname, error = %e, "Failed to delete shared link");
                }
            }
            Ok(false) => debug!(ifname, "Shared link already gone"),
            Err(e) => warn!(ifname, error = %e, "Failed to look up shared link"),
        }
    }

    async fn unbind_dpdk(&self, bound: &BoundInterface) -> SriovResult<()> {
        let Some(kernel_driver) = bound.kernel_driver.as_deref() else {
            return Err(SriovError::driver_bind(
                bound.vf.pci_addr.as_str(),
                "",
                "attachment has no kernel driver recorded",
            ));
        };
        self.drivers
            .bind(&bound.vf.pci_addr, kernel_driver, bound.dpdk_tool.as_deref())
            .await
    }

    fn host_ifname(&self, vf: &VfRef) -> SriovResult<String> {
        self.pool.host_netdev(&vf.pci_addr)?.ok_or_else(|| {
            SriovError::interface_bind(vf.to_string(), "VF has no netdev in the host namespace")
        })
    }
}

/// Host-side name of a shared-mode macvlan before it moves into the
/// container. Short enough for IFNAMSIZ and stable per attachment.
fn shared_link_name(container_id: &str, ifname: &str) -> String {
    let mut hasher = DefaultHasher::new();
    container_id.hash(&mut hasher);
    ifname.hash(&mut hasher);
    format!("sv{:08x}", hasher.finish() as u32)
}

fn as_bind_error(ifname: &str, err: SriovError) -> SriovError {
    match err {
        SriovError::ShellCommandFailed { .. } | SriovError::ShellExec { .. } => {
            SriovError::interface_bind(ifname, err.to_string())
        }
        other => other,
    }
}
