//! In-memory stand-ins for the kernel and the IPAM plugin
//!
//! The fakes keep the [`FakeNode`] sysfs tree in step with what they do, so
//! the plugin's own device inspection sees the effects: a VF netdev that
//! leaves the host disappears from `net/`, a driver rebind moves the
//! `driver` link.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use sriov_cni::driver::DriverOps;
use sriov_cni::ipam::{IpamBackend, IpamEnv};
use sriov_cni::link::LinkOps;
use sriov_cni::netns::NetNs;
use sriov_cni::result::{CniResult, IpConfig, Route};
use sriov_cni::PciAddress;
use sriov_cni_common::{SriovError, SriovResult};

use crate::fixtures::FakeNode;

/// Namespace key used for the host
pub const HOST: &str = "host";

fn scope(ns: Option<&NetNs>) -> String {
    ns.map(|ns| ns.path().display().to_string())
        .unwrap_or_else(|| HOST.to_string())
}

fn ip_failure(op: &str, message: &str) -> SriovError {
    SriovError::ShellCommandFailed {
        command: format!("/sbin/ip {}", op),
        exit_code: 1,
        output: message.to_string(),
    }
}

/// Kinds of link operations, for fault injection and counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOpKind {
    Vlan,
    Up,
    Down,
    Rename,
    Move,
    Macvlan,
    Delete,
    Address,
    Route,
}

/// A link as the fake kernel knows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub netns: String,
    pub name: String,
    /// Backing VF, for VF netdevs
    pub pci_addr: Option<String>,
    pub up: bool,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<(IpNet, Option<IpAddr>)>,
}

#[derive(Default)]
struct LinkTable {
    links: Vec<FakeLink>,
    vlans: HashMap<(String, u32), u16>,
    ops: Vec<(LinkOpKind, String)>,
    fail_on: Option<LinkOpKind>,
}

impl LinkTable {
    fn find(&self, netns: &str, name: &str) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.netns == netns && l.name == name)
    }

    fn find_or_fail(&self, netns: &str, name: &str, op: &str) -> SriovResult<usize> {
        self.find(netns, name).ok_or_else(|| {
            ip_failure(op, &format!("Cannot find device \"{}\" in {}", name, netns))
        })
    }
}

/// [`LinkOps`] over an in-memory link table
pub struct RecordingLinks {
    sysfs: PathBuf,
    table: Mutex<LinkTable>,
}

impl RecordingLinks {
    /// Starts with every VF netdev of `node` in the host namespace.
    pub fn new(node: &FakeNode) -> Self {
        let mut table = LinkTable::default();
        let devices = node.sysfs().join("bus/pci/devices");
        if let Ok(entries) = fs::read_dir(&devices) {
            for entry in entries.flatten() {
                let pci_addr = entry.file_name().to_string_lossy().into_owned();
                let Ok(names) = fs::read_dir(entry.path().join("net")) else {
                    continue;
                };
                for name in names.flatten() {
                    table.links.push(FakeLink {
                        netns: HOST.to_string(),
                        name: name.file_name().to_string_lossy().into_owned(),
                        pci_addr: Some(pci_addr.clone()),
                        up: false,
                        addresses: Vec::new(),
                        routes: Vec::new(),
                    });
                }
            }
        }
        Self {
            sysfs: node.sysfs().to_path_buf(),
            table: Mutex::new(table),
        }
    }

    /// Makes the next operation of `kind` fail.
    pub fn fail_next(&self, kind: LinkOpKind) {
        self.table.lock().fail_on = Some(kind);
    }

    pub fn link(&self, netns: &str, name: &str) -> Option<FakeLink> {
        let table = self.table.lock();
        table.find(netns, name).map(|i| table.links[i].clone())
    }

    pub fn links_in(&self, netns: &str) -> Vec<FakeLink> {
        self.table
            .lock()
            .links
            .iter()
            .filter(|l| l.netns == netns)
            .cloned()
            .collect()
    }

    pub fn vlan(&self, pf: &str, vf_index: u32) -> u16 {
        self.table
            .lock()
            .vlans
            .get(&(pf.to_string(), vf_index))
            .copied()
            .unwrap_or(0)
    }

    /// Operations performed so far, as `(kind, description)`.
    pub fn ops(&self) -> Vec<(LinkOpKind, String)> {
        self.table.lock().ops.clone()
    }

    pub fn op_count(&self) -> usize {
        self.table.lock().ops.len()
    }

    /// Simulates the namespace being destroyed: VF netdevs fall back to the
    /// host under their current names, virtual links vanish.
    pub fn destroy_namespace(&self, path: &Path) {
        let key = path.display().to_string();
        let mut table = self.table.lock();
        table.links.retain(|l| l.netns != key || l.pci_addr.is_some());
        for link in table.links.iter_mut().filter(|l| l.netns == key) {
            link.netns = HOST.to_string();
            link.up = false;
            link.addresses.clear();
            link.routes.clear();
            if let Some(pci_addr) = link.pci_addr.as_deref() {
                self.show_netdev(pci_addr, &link.name);
            }
        }
        let _ = fs::remove_file(path);
    }

    fn netdev_dir(&self, pci_addr: &str, name: &str) -> PathBuf {
        self.sysfs
            .join("bus/pci/devices")
            .join(pci_addr)
            .join("net")
            .join(name)
    }

    fn show_netdev(&self, pci_addr: &str, name: &str) {
        let _ = fs::create_dir_all(self.netdev_dir(pci_addr, name));
    }

    fn hide_netdev(&self, pci_addr: &str, name: &str) {
        let _ = fs::remove_dir_all(self.netdev_dir(pci_addr, name));
    }

    fn begin(&self, table: &mut LinkTable, kind: LinkOpKind, what: String) -> SriovResult<()> {
        table.ops.push((kind, what.clone()));
        if table.fail_on == Some(kind) {
            table.fail_on = None;
            return Err(ip_failure(&what, "RTNETLINK answers: Operation not permitted"));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl LinkOps for RecordingLinks {
    async fn set_vf_vlan(&self, pf: &str, vf_index: u32, vlan: u16) -> SriovResult<()> {
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Vlan, format!("{} vf {} vlan {}", pf, vf_index, vlan))?;
        table.vlans.insert((pf.to_string(), vf_index), vlan);
        Ok(())
    }

    async fn set_up(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Up, format!("{} {} up", key, ifname))?;
        let i = table.find_or_fail(&key, ifname, "link set up")?;
        table.links[i].up = true;
        Ok(())
    }

    async fn set_down(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Down, format!("{} {} down", key, ifname))?;
        let i = table.find_or_fail(&key, ifname, "link set down")?;
        table.links[i].up = false;
        Ok(())
    }

    async fn rename(&self, netns: Option<&NetNs>, ifname: &str, new_name: &str) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(
            &mut table,
            LinkOpKind::Rename,
            format!("{} {} -> {}", key, ifname, new_name),
        )?;
        let i = table.find_or_fail(&key, ifname, "link set name")?;
        if table.find(&key, new_name).is_some() {
            return Err(ip_failure("link set name", "RTNETLINK answers: File exists"));
        }
        table.links[i].name = new_name.to_string();
        if key == HOST {
            if let Some(pci_addr) = table.links[i].pci_addr.clone() {
                self.hide_netdev(&pci_addr, ifname);
                self.show_netdev(&pci_addr, new_name);
            }
        }
        Ok(())
    }

    async fn move_to(
        &self,
        from: Option<&NetNs>,
        ifname: &str,
        to: Option<&NetNs>,
    ) -> SriovResult<()> {
        let (from, to) = (scope(from), scope(to));
        let mut table = self.table.lock();
        self.begin(
            &mut table,
            LinkOpKind::Move,
            format!("{} {} -> {}", from, ifname, to),
        )?;
        let i = table.find_or_fail(&from, ifname, "link set netns")?;
        if table.find(&to, ifname).is_some() {
            return Err(ip_failure("link set netns", "RTNETLINK answers: File exists"));
        }
        table.links[i].netns = to.clone();
        if let Some(pci_addr) = table.links[i].pci_addr.clone() {
            if from == HOST {
                self.hide_netdev(&pci_addr, ifname);
            }
            if to == HOST {
                self.show_netdev(&pci_addr, ifname);
            }
        }
        Ok(())
    }

    async fn add_macvlan(&self, parent: &str, ifname: &str) -> SriovResult<()> {
        let mut table = self.table.lock();
        self.begin(
            &mut table,
            LinkOpKind::Macvlan,
            format!("{} macvlan on {}", ifname, parent),
        )?;
        table.find_or_fail(HOST, parent, "link add")?;
        if table.find(HOST, ifname).is_some() {
            return Err(ip_failure("link add", "RTNETLINK answers: File exists"));
        }
        table.links.push(FakeLink {
            netns: HOST.to_string(),
            name: ifname.to_string(),
            pci_addr: None,
            up: false,
            addresses: Vec::new(),
            routes: Vec::new(),
        });
        Ok(())
    }

    async fn delete(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Delete, format!("{} {}", key, ifname))?;
        let i = table.find_or_fail(&key, ifname, "link del")?;
        table.links.remove(i);
        Ok(())
    }

    async fn exists(&self, netns: Option<&NetNs>, ifname: &str) -> SriovResult<bool> {
        Ok(self.table.lock().find(&scope(netns), ifname).is_some())
    }

    async fn add_address(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        addr: &IpNet,
    ) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Address, format!("{} {} {}", key, ifname, addr))?;
        let i = table.find_or_fail(&key, ifname, "address add")?;
        table.links[i].addresses.push(*addr);
        Ok(())
    }

    async fn add_route(
        &self,
        netns: Option<&NetNs>,
        ifname: &str,
        dst: &IpNet,
        gw: Option<IpAddr>,
    ) -> SriovResult<()> {
        let key = scope(netns);
        let mut table = self.table.lock();
        self.begin(&mut table, LinkOpKind::Route, format!("{} {} {}", key, ifname, dst))?;
        let i = table.find_or_fail(&key, ifname, "route add")?;
        table.links[i].routes.push((*dst, gw));
        Ok(())
    }
}

/// [`DriverOps`] that rewires the fake sysfs `driver` links
pub struct FakeDrivers {
    sysfs: PathBuf,
    userspace: Vec<String>,
    /// Netdev names hidden while a VF sits on a userspace driver
    parked: Mutex<HashMap<String, Vec<String>>>,
    binds: Mutex<Vec<(String, String)>>,
    fail_driver: Mutex<Option<String>>,
}

impl FakeDrivers {
    pub fn new(node: &FakeNode) -> Self {
        Self {
            sysfs: node.sysfs().to_path_buf(),
            userspace: node.settings.userspace_drivers.clone(),
            parked: Mutex::new(HashMap::new()),
            binds: Mutex::new(Vec::new()),
            fail_driver: Mutex::new(None),
        }
    }

    /// Makes binds to `driver` fail.
    pub fn fail_on(&self, driver: &str) {
        *self.fail_driver.lock() = Some(driver.to_string());
    }

    /// Binds performed so far, as `(pci_addr, driver)`.
    pub fn binds(&self) -> Vec<(String, String)> {
        self.binds.lock().clone()
    }

    fn device_dir(&self, pci_addr: &PciAddress) -> PathBuf {
        self.sysfs.join("bus/pci/devices").join(pci_addr.as_str())
    }
}

#[async_trait]
impl DriverOps for FakeDrivers {
    async fn bind(
        &self,
        pci_addr: &PciAddress,
        driver: &str,
        _tool: Option<&Path>,
    ) -> SriovResult<()> {
        self.binds
            .lock()
            .push((pci_addr.to_string(), driver.to_string()));
        if self.fail_driver.lock().as_deref() == Some(driver) {
            return Err(SriovError::driver_bind(
                pci_addr.as_str(),
                driver,
                "probe failed",
            ));
        }

        let device_dir = self.device_dir(pci_addr);
        let net_dir = device_dir.join("net");
        if self.userspace.iter().any(|d| d == driver) {
            let names = fs::read_dir(&net_dir)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if !names.is_empty() {
                self.parked.lock().insert(pci_addr.to_string(), names);
            }
            let _ = fs::remove_dir_all(&net_dir);
        } else if let Some(names) = self.parked.lock().remove(pci_addr.as_str()) {
            for name in names {
                fs::create_dir_all(net_dir.join(name))
                    .map_err(|e| SriovError::io(&net_dir, e))?;
            }
        }

        let driver_dir = self.sysfs.join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&driver_dir).map_err(|e| SriovError::io(&driver_dir, e))?;
        let link = device_dir.join("driver");
        let _ = fs::remove_file(&link);
        symlink(&driver_dir, &link).map_err(|e| SriovError::io(&link, e))
    }

    async fn current(&self, pci_addr: &PciAddress) -> SriovResult<Option<String>> {
        let link = self.device_dir(pci_addr).join("driver");
        Ok(fs::read_link(&link)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned())))
    }
}

/// [`IpamBackend`] returning a fixed result and counting calls
pub struct FakeIpam {
    result: Mutex<SriovResult<CniResult>>,
    adds: AtomicUsize,
    dels: AtomicUsize,
    fail_del: Mutex<bool>,
    last_env: Mutex<Option<IpamEnv>>,
}

impl FakeIpam {
    /// Hands out `10.56.217.<host>/24` with a default route.
    pub fn with_address(host: u8) -> Self {
        let ip: IpNet = format!("10.56.217.{}/24", host)
            .parse()
            .expect("valid prefix");
        let default: IpNet = "0.0.0.0/0".parse().expect("valid prefix");
        Self::with_result(Ok(CniResult {
            ip4: Some(IpConfig {
                ip,
                gateway: "10.56.217.1".parse().ok(),
                routes: vec![Route {
                    dst: default,
                    gw: None,
                }],
            }),
            ..CniResult::empty("0.2.0")
        }))
    }

    /// Answers with a result that has no IPv4 section.
    pub fn without_ip4() -> Self {
        Self::with_result(Ok(CniResult::empty("0.2.0")))
    }

    /// Fails every ADD.
    pub fn failing() -> Self {
        Self::with_result(Err(SriovError::AddressBackend {
            plugin: "host-local".to_string(),
            code: Some(11),
            message: "no IP addresses available in range set".to_string(),
        }))
    }

    fn with_result(result: SriovResult<CniResult>) -> Self {
        Self {
            result: Mutex::new(result),
            adds: AtomicUsize::new(0),
            dels: AtomicUsize::new(0),
            fail_del: Mutex::new(false),
            last_env: Mutex::new(None),
        }
    }

    pub fn fail_releases(&self) {
        *self.fail_del.lock() = true;
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn dels(&self) -> usize {
        self.dels.load(Ordering::SeqCst)
    }

    pub fn last_env(&self) -> Option<IpamEnv> {
        self.last_env.lock().clone()
    }
}

#[async_trait]
impl IpamBackend for FakeIpam {
    async fn add(&self, plugin: &str, _payload: &[u8], env: &IpamEnv) -> SriovResult<CniResult> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        *self.last_env.lock() = Some(env.clone());
        match &*self.result.lock() {
            Ok(result) => Ok(result.clone()),
            Err(e) => Err(SriovError::AddressBackend {
                plugin: plugin.to_string(),
                code: Some(e.code()),
                message: e.to_string(),
            }),
        }
    }

    async fn del(&self, plugin: &str, _payload: &[u8], env: &IpamEnv) -> SriovResult<()> {
        self.dels.fetch_add(1, Ordering::SeqCst);
        *self.last_env.lock() = Some(env.clone());
        if *self.fail_del.lock() {
            return Err(SriovError::address_backend(plugin, "release failed"));
        }
        Ok(())
    }
}
