//! Link, address and route operations
//!
//! Operations take the namespace they act in; `None` is the host namespace
//! of the calling thread. Implementations switch the calling thread with
//! [`NetNs::enter`], so the futures they return are not `Send` and must be
//! driven on the thread that opened the handles.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::IpNet;
use sriov_cni_common::shell::{self, shellquote, IP_CMD};
use sriov_cni_common::SriovResult;
use tracing::info;

use crate::netns::NetNs;

/// Kernel link operations used by the interface binder and the address
/// coordinator.
#[async_trait(?Send)]
pub trait LinkOps: Send + Sync {
    /// Programs a VLAN tag on a VF through its PF (0 clears it).
    async fn set_vf_vlan(&self, pf: &str, vf_index: u32, vlan: u16) -> SriovResult<()>;

    async fn set_up(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()>;

    async fn set_down(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()>;

    async fn rename(&self, netns: Option<&NetNs>, ifname: &str, new_name: &str)
        -> SriovResult<()>;

    /// Moves `ifname` from namespace `from` into namespace `to`.
    async fn move_to(
        &self,
        from: Option<&NetNs>,
        ifname: &str,
        to: Option<&NetNs>,
    ) -> SriovResult<()>;

    /// Creates a bridge-mode macvlan named `ifname` on top of the host link
    /// `parent`.
    async fn add_macvlan(&self, parent: &str, ifname: &str) -> SriovResult<()>;

    async fn delete(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()>;

    async fn exists(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<bool>;

    async fn add_address(&self, netns: Option<&NetNs>, ifname: &str, addr: &IpNet)
        -> SriovResult<()>;

    async fn add_route(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        dst: &IpNet,
        gw: Option<IpAddr>,
    ) -> SriovResult<()>;
}

/// [`LinkOps`] over `ip(8)`
#[derive(Debug, Default)]
pub struct IpLinkOps {
    #[cfg(test)]
    mock_mode: bool,
    #[cfg(test)]
    captured_commands: parking_lot::Mutex<Vec<String>>,
}

impl IpLinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables mock mode for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().clone()
    }

    async fn exec(&self, netns: Option<&NetNs>, cmd: String) -> SriovResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            info!("Mock exec: {}", cmd);
            self.captured_commands.lock().push(cmd);
            return Ok(String::new());
        }

        match netns {
            Some(ns) => ns.run_in(shell::exec_or_throw(&cmd)).await?,
            None => shell::exec_or_throw(&cmd).await,
        }
    }
}

#[async_trait(?Send)]
impl LinkOps for IpLinkOps {
    async fn set_vf_vlan(&self, pf: &str, vf_index: u32, vlan: u16) -> SriovResult<()> {
        self.exec(
            None,
            format!(
                "{} link set dev {} vf {} vlan {}",
                IP_CMD,
                shellquote(pf),
                vf_index,
                vlan
            ),
        )
        .await?;
        info!(pf, vf_index, vlan, "Set VF VLAN");
        Ok(())
    }

    async fn set_up(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        self.exec(
            netns,
            format!("{} link set dev {} up", IP_CMD, shellquote(ifname)),
        )
        .await?;
        Ok(())
    }

    async fn set_down(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        self.exec(
            netns,
            format!("{} link set dev {} down", IP_CMD, shellquote(ifname)),
        )
        .await?;
        Ok(())
    }

    async fn rename(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        new_name: &str,
    ) -> SriovResult<()> {
        self.exec(
            netns,
            format!(
                "{} link set dev {} name {}",
                IP_CMD,
                shellquote(ifname),
                shellquote(new_name)
            ),
        )
        .await?;
        info!("Renamed {} to {}", ifname, new_name);
        Ok(())
    }

    async fn move_to(
        &self,
        from: Option<&NetNs>,
        ifname: &str,
        to: Option<&NetNs>,
    ) -> SriovResult<()> {
        // Namespace work runs on a worker thread; the main thread never
        // leaves the host namespace, so the process' own netns is the host.
        let target = match to {
            Some(ns) => ns.fd_path(),
            None => PathBuf::from(format!("/proc/{}/ns/net", std::process::id())),
        };
        self.exec(
            from,
            format!(
                "{} link set dev {} netns {}",
                IP_CMD,
                shellquote(ifname),
                shellquote(&target.to_string_lossy())
            ),
        )
        .await?;
        info!("Moved {} to netns {}", ifname, target.display());
        Ok(())
    }

    async fn add_macvlan(&self, parent: &str, ifname: &str) -> SriovResult<()> {
        self.exec(
            None,
            format!(
                "{} link add link {} name {} type macvlan mode bridge",
                IP_CMD,
                shellquote(parent),
                shellquote(ifname)
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        self.exec(
            netns,
            format!("{} link del dev {}", IP_CMD, shellquote(ifname)),
        )
        .await?;
        Ok(())
    }

    async fn exists(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<bool> {
        #[cfg(test)]
        if self.mock_mode {
            return Ok(true);
        }

        let cmd = format!("{} link show dev {}", IP_CMD, shellquote(ifname));
        let result = match netns {
            Some(ns) => ns.run_in(shell::exec(&cmd)).await??,
            None => shell::exec(&cmd).await?,
        };
        Ok(result.success())
    }

    async fn add_address(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        addr: &IpNet,
    ) -> SriovResult<()> {
        let family = match addr {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };
        self.exec(
            netns,
            format!(
                "{} {} address add {} dev {}",
                IP_CMD,
                family,
                shellquote(&addr.to_string()),
                shellquote(ifname)
            ),
        )
        .await?;
        info!("Added address {} on {}", addr, ifname);
        Ok(())
    }

    async fn add_route(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        dst: &IpNet,
        gw: Option<IpAddr>,
    ) -> SriovResult<()> {
        let via = gw
            .map(|gw| format!(" via {}", shellquote(&gw.to_string())))
            .unwrap_or_default();
        self.exec(
            netns,
            format!(
                "{} route add {}{} dev {}",
                IP_CMD,
                shellquote(&dst.to_string()),
                via,
                shellquote(ifname)
            ),
        )
        .await?;
        Ok(())
    }
}
