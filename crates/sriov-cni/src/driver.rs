//! PCI driver binding
//!
//! A VF moves between its kernel driver and a userspace I/O driver either
//! through sysfs (`driver/unbind`, `driver_override`, `drivers_probe`) or
//! through an external devbind helper when the descriptor names one.

use std::path::Path;

use async_trait::async_trait;
use sriov_cni_common::shell::{self, shellquote};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, info, instrument, warn};

use crate::inspector::DevicePool;
use crate::types::PciAddress;

/// Driver transitions for a PCI device
#[async_trait]
pub trait DriverOps: Send + Sync {
    /// Binds `pci_addr` to `driver`, unbinding it from its current driver
    /// first. `tool` selects an external devbind helper instead of sysfs.
    async fn bind(
        &self,
        pci_addr: &PciAddress,
        driver: &str,
        tool: Option<&Path>,
    ) -> SriovResult<()>;

    /// Driver currently bound to `pci_addr`.
    async fn current(&self, pci_addr: &PciAddress) -> SriovResult<Option<String>>;
}

/// [`DriverOps`] on the running host
#[derive(Debug, Clone)]
pub struct HostDriverOps {
    pool: DevicePool,
}

impl HostDriverOps {
    pub fn new(pool: DevicePool) -> Self {
        Self { pool }
    }

    async fn write_attr(
        &self,
        path: &Path,
        value: &str,
        pci_addr: &PciAddress,
        driver: &str,
    ) -> SriovResult<()> {
        debug!(path = %path.display(), value, "Writing sysfs attribute");
        tokio::fs::write(path, value).await.map_err(|e| {
            SriovError::driver_bind(
                pci_addr.as_str(),
                driver,
                format!("write to {} failed: {}", path.display(), e),
            )
        })
    }

    async fn bind_sysfs(&self, pci_addr: &PciAddress, driver: &str) -> SriovResult<()> {
        let device_dir = self.pool.pci_device_dir(pci_addr);

        if self.pool.driver_of(pci_addr)?.is_some() {
            self.write_attr(
                &device_dir.join("driver/unbind"),
                pci_addr.as_str(),
                pci_addr,
                driver,
            )
            .await?;
        }

        self.write_attr(&device_dir.join("driver_override"), driver, pci_addr, driver)
            .await?;
        self.write_attr(
            &self.pool.sysfs_root().join("bus/pci/drivers_probe"),
            pci_addr.as_str(),
            pci_addr,
            driver,
        )
        .await?;

        // Clear the override so later probes match by device id again.
        if let Err(e) = tokio::fs::write(device_dir.join("driver_override"), "\n").await {
            warn!(pci_addr = %pci_addr, error = %e, "Failed to clear driver_override");
        }

        let bound = self.pool.driver_of(pci_addr)?;
        if bound.as_deref() != Some(driver) {
            return Err(SriovError::driver_bind(
                pci_addr.as_str(),
                driver,
                format!("device is bound to {:?} after probe", bound),
            ));
        }
        Ok(())
    }

    async fn bind_tool(
        &self,
        pci_addr: &PciAddress,
        driver: &str,
        tool: &Path,
    ) -> SriovResult<()> {
        let cmd = format!(
            "{} -b {} {}",
            shellquote(&tool.to_string_lossy()),
            shellquote(driver),
            shellquote(pci_addr.as_str())
        );
        shell::exec_or_throw(&cmd)
            .await
            .map_err(|e| SriovError::driver_bind(pci_addr.as_str(), driver, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DriverOps for HostDriverOps {
    #[instrument(skip(self))]
    async fn bind(
        &self,
        pci_addr: &PciAddress,
        driver: &str,
        tool: Option<&Path>,
    ) -> SriovResult<()> {
        if self.pool.driver_of(pci_addr)?.as_deref() == Some(driver) {
            debug!("Already bound");
            return Ok(());
        }

        match tool {
            Some(tool) => self.bind_tool(pci_addr, driver, tool).await?,
            None => self.bind_sysfs(pci_addr, driver).await?,
        }
        info!("Bound {} to {}", pci_addr, driver);
        Ok(())
    }

    async fn current(&self, pci_addr: &PciAddress) -> SriovResult<Option<String>> {
        self.pool.driver_of(pci_addr)
    }
}
