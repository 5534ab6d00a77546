//! Attachment orchestration
//!
//! Drives one ADD or DEL end to end. ADD moves forward through [`AddState`]
//! and, on failure, walks the same states backwards running each state's
//! compensation before returning the original error. DEL is the reverse
//! path run deliberately, tolerating whatever has already disappeared.

use std::path::PathBuf;
use std::sync::Arc;

use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::{PoolGuard, VfAllocator};
use crate::binder::{BoundInterface, InterfaceBinder};
use crate::config::{validate_container_id, validate_ifname, NetConf, PluginSettings};
use crate::driver::{DriverOps, HostDriverOps};
use crate::inspector::DevicePool;
use crate::ipam::{AddressCoordinator, ExecIpam, IpamBackend, IpamEnv};
use crate::link::{IpLinkOps, LinkOps};
use crate::netns::NetNs;
use crate::record::AttachmentRecord;
use crate::result::{CniResult, Interface};
use crate::types::{BindMode, VfRef};

/// One CNI invocation as handed over by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniRequest {
    pub container_id: String,
    /// Namespace path; DEL may legitimately receive none
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub args: String,
    pub path: Vec<PathBuf>,
    /// Descriptor bytes read from stdin
    pub payload: Vec<u8>,
}

impl CniRequest {
    fn ipam_env(&self, ifname: &str) -> IpamEnv {
        IpamEnv {
            container_id: self.container_id.clone(),
            netns: self
                .netns
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ifname: ifname.to_string(),
            args: self.args.clone(),
            path: self.path.clone(),
        }
    }

    /// Namespace path, with an empty `CNI_NETNS` treated as absent.
    fn netns_path(&self) -> Option<&PathBuf> {
        self.netns.as_ref().filter(|p| !p.as_os_str().is_empty())
    }
}

/// Progress of an ADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddState {
    Start,
    DescriptorReady,
    NamespaceReady,
    VfAcquired,
    InterfaceBound,
    AddressApplied,
    Done,
}

impl AddState {
    /// State to fall back to when undoing this one.
    pub fn previous(self) -> Option<AddState> {
        match self {
            AddState::Start => None,
            AddState::DescriptorReady => Some(AddState::Start),
            AddState::NamespaceReady => Some(AddState::DescriptorReady),
            AddState::VfAcquired => Some(AddState::NamespaceReady),
            AddState::InterfaceBound => Some(AddState::VfAcquired),
            AddState::AddressApplied => Some(AddState::InterfaceBound),
            AddState::Done => None,
        }
    }
}

/// What an attachment holds on its VF in the pool records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// An exclusive claim record
    Claim,
    /// An entry in the VF's shared-use record
    Shared,
    /// Nothing; another container already claimed the named VF
    None,
}

/// What an in-flight ADD holds, so it can be given back.
struct AddProgress {
    state: AddState,
    conf: Option<NetConf>,
    ifname: String,
    vf: Option<VfRef>,
    hold: Hold,
    bound: Option<BoundInterface>,
    cni_dir: Option<PathBuf>,
    ipam_attempted: bool,
}

impl AddProgress {
    fn new() -> Self {
        Self {
            state: AddState::Start,
            conf: None,
            ifname: String::new(),
            vf: None,
            hold: Hold::None,
            bound: None,
            cni_dir: None,
            ipam_attempted: false,
        }
    }

    fn advance(&mut self, state: AddState) {
        debug!(from = ?self.state, to = ?state, "ADD state");
        self.state = state;
    }
}

/// Runs ADD and DEL against one node's devices.
pub struct Attachments {
    settings: PluginSettings,
    allocator: VfAllocator,
    binder: InterfaceBinder,
    addresses: AddressCoordinator,
}

impl Attachments {
    pub fn new(
        settings: PluginSettings,
        links: Arc<dyn LinkOps>,
        drivers: Arc<dyn DriverOps>,
        ipam: Arc<dyn IpamBackend>,
    ) -> Self {
        let allocator = VfAllocator::new(&settings);
        let binder = InterfaceBinder::new(DevicePool::new(&settings), links.clone(), drivers);
        let addresses = AddressCoordinator::new(ipam, links);
        Self {
            settings,
            allocator,
            binder,
            addresses,
        }
    }

    /// Wires the real `ip`, sysfs and IPAM implementations.
    pub fn on_host(settings: PluginSettings) -> Self {
        let drivers = HostDriverOps::new(DevicePool::new(&settings));
        Self::new(
            settings,
            Arc::new(IpLinkOps::new()),
            Arc::new(drivers),
            Arc::new(ExecIpam::new()),
        )
    }

    pub fn allocator(&self) -> &VfAllocator {
        &self.allocator
    }

    /// Attaches a VF to the container. All-or-nothing: on error every
    /// completed step has been undone.
    #[instrument(skip_all, fields(container_id = %req.container_id, ifname = %req.ifname))]
    pub async fn add(&self, req: &CniRequest) -> SriovResult<CniResult> {
        let mut progress = AddProgress::new();
        match self.add_steps(req, &mut progress).await {
            Ok(result) => {
                progress.advance(AddState::Done);
                info!("Attachment added");
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, state = ?progress.state, "ADD failed, rolling back");
                self.roll_back(req, &mut progress).await;
                Err(e)
            }
        }
    }

    async fn add_steps(&self, req: &CniRequest, progress: &mut AddProgress) -> SriovResult<CniResult> {
        let conf = NetConf::parse(&req.payload)?;
        conf.check_shared_mode()?;
        validate_container_id(&req.container_id)?;
        let ifname = conf.interface_name(&req.ifname).to_string();
        validate_ifname(&ifname)?;
        let cni_dir = conf.cni_dir(&self.settings);
        progress.ifname = ifname.clone();
        progress.cni_dir = Some(cni_dir.clone());
        progress.conf = Some(conf.clone());
        progress.advance(AddState::DescriptorReady);

        let netns_path = req
            .netns_path()
            .ok_or_else(|| SriovError::config("CNI_NETNS", "namespace path is required for ADD"))?;
        let ns = NetNs::open(netns_path)?;
        progress.advance(AddState::NamespaceReady);

        let (vf, hold) = self.acquire(&conf, &req.container_id, &ifname)?;
        info!(vf = %vf, ?hold, "VF acquired");
        progress.vf = Some(vf.clone());
        progress.hold = hold;
        progress.advance(AddState::VfAcquired);

        let bound = self
            .binder
            .bind(&conf, &vf, &req.container_id, &ifname, &ns)
            .await?;
        progress.bound = Some(bound.clone());
        progress.advance(AddState::InterfaceBound);

        AttachmentRecord {
            container_id: req.container_id.clone(),
            claimed: hold == Hold::Claim,
            interface: bound.clone(),
        }
        .save(&cni_dir)?;

        let interface = Interface {
            name: ifname.clone(),
            sandbox: (bound.mode != BindMode::Dpdk)
                .then(|| ns.path().to_string_lossy().into_owned()),
            pci_address: Some(vf.pci_addr.to_string()),
        };

        if conf.l2enable {
            let mut result = CniResult::empty(conf.cni_version.clone());
            result.dns = conf.dns.clone();
            return Ok(result.with_interface(interface));
        }

        progress.ipam_attempted = true;
        let env = req.ipam_env(&ifname);
        let result = self
            .addresses
            .apply(&conf, &req.payload, &env, &bound, &ns, &cni_dir)
            .await?;
        progress.advance(AddState::AddressApplied);

        let result = result.unwrap_or_else(|| {
            let mut empty = CniResult::empty(conf.cni_version.clone());
            empty.dns = conf.dns.clone();
            empty
        });
        Ok(result.with_interface(interface))
    }

    fn acquire(
        &self,
        conf: &NetConf,
        container_id: &str,
        ifname: &str,
    ) -> SriovResult<(VfRef, Hold)> {
        if let Some(device) = conf.deviceinfo.as_ref() {
            let vf = device.resolve()?;
            if conf.sharedvf {
                self.allocator.share(&vf, container_id, ifname)?;
                return Ok((vf, Hold::Shared));
            }
            let hold = if self.allocator.claim(&vf, container_id)? {
                Hold::Claim
            } else {
                Hold::None
            };
            return Ok((vf, hold));
        }

        let pf = conf
            .master
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| SriovError::config("master", "either master or deviceinfo is required"))?;
        if conf.sharedvf {
            let vf = self.allocator.select_shared(pf, container_id, ifname)?;
            Ok((vf.id, Hold::Shared))
        } else {
            Ok((self.allocator.allocate(pf, container_id)?.id, Hold::Claim))
        }
    }

    /// Undoes an ADD from whatever state it reached.
    async fn roll_back(&self, req: &CniRequest, progress: &mut AddProgress) {
        let ns = req.netns_path().and_then(|p| NetNs::open(p).ok());

        while let Some(previous) = progress.state.previous() {
            match progress.state {
                AddState::AddressApplied => self.roll_back_addresses(req, progress).await,
                // Also covers an IPAM call that failed partway.
                AddState::InterfaceBound => {
                    self.roll_back_addresses(req, progress).await;
                    self.roll_back_interface(req, progress, ns.as_ref()).await;
                }
                AddState::VfAcquired => {
                    if let Some(vf) = progress.vf.as_ref() {
                        let released = match progress.hold {
                            Hold::Claim => self.allocator.release(vf, &req.container_id),
                            Hold::Shared => self.allocator.release_shared(
                                vf,
                                &req.container_id,
                                &progress.ifname,
                            ),
                            Hold::None => Ok(()),
                        };
                        if let Err(e) = released {
                            warn!(vf = %vf, error = %e, "Failed to release VF");
                        }
                    }
                }
                _ => {}
            }
            progress.state = previous;
        }
    }

    async fn roll_back_addresses(&self, req: &CniRequest, progress: &mut AddProgress) {
        if !progress.ipam_attempted {
            return;
        }
        progress.ipam_attempted = false;
        if let Some(conf) = progress.conf.as_ref() {
            let env = req.ipam_env(&progress.ifname);
            // Failures are logged by the coordinator.
            let _ = self.addresses.release(conf, &req.payload, &env).await;
        }
    }

    async fn roll_back_interface(
        &self,
        req: &CniRequest,
        progress: &mut AddProgress,
        ns: Option<&NetNs>,
    ) {
        if let Some(bound) = progress.bound.take() {
            if let Err(e) = self.binder.unbind(&bound, ns).await {
                warn!(error = %e, "Failed to unbind VF");
            }
            if let Some(cni_dir) = progress.cni_dir.as_ref() {
                if let Err(e) = AttachmentRecord::remove(cni_dir, &req.container_id, &bound.ifname) {
                    warn!(error = %e, "Failed to remove attachment record");
                }
            }
        }
    }

    /// Detaches whatever ADD attached. Succeeds when nothing is left.
    #[instrument(skip_all, fields(container_id = %req.container_id, ifname = %req.ifname))]
    pub async fn del(&self, req: &CniRequest) -> SriovResult<()> {
        let conf = NetConf::parse(&req.payload)?;
        validate_container_id(&req.container_id)?;
        let ifname = conf.interface_name(&req.ifname).to_string();
        let cni_dir = conf.cni_dir(&self.settings);

        let env = req.ipam_env(&ifname);
        if let Err(e) = self.addresses.release(&conf, &req.payload, &env).await {
            warn!(error = %e, "Continuing teardown after IPAM release failure");
        }

        let record = match AttachmentRecord::load(&cni_dir, &req.container_id, &ifname) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Unreadable attachment record, treating as absent");
                None
            }
        };
        let Some(record) = record else {
            info!("No attachment record, releasing leftover claims only");
            self.release_leftover_claims(&conf, &req.container_id, &ifname);
            return Ok(());
        };

        let ns = match req.netns_path() {
            None => {
                debug!("No namespace path given");
                None
            }
            Some(path) => match NetNs::open(path) {
                Ok(ns) => Some(ns),
                Err(e) if e.is_namespace_missing() => {
                    info!(netns = %path.display(), "Namespace is gone");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Cannot open namespace, tearing down host side only");
                    None
                }
            },
        };

        let vf = &record.interface.vf;
        // Held until the VF is back in the pool.
        let guard = self.allocator.lock(&vf.pf_name)?;
        if let Some(holder) = self.held_elsewhere(&guard, &record)? {
            warn!(
                vf = %vf,
                holder = %holder,
                "VF now belongs to another attachment, dropping stale record only"
            );
            drop(guard);
            AttachmentRecord::remove(&cni_dir, &req.container_id, &ifname)?;
            return Ok(());
        }

        self.binder.unbind(&record.interface, ns.as_ref()).await?;
        if record.interface.mode == BindMode::Shared {
            guard.release_shared(vf, &req.container_id, &ifname)?;
        } else if record.claimed {
            guard.release(vf, &req.container_id)?;
        }
        drop(guard);
        AttachmentRecord::remove(&cni_dir, &req.container_id, &ifname)?;
        info!("Attachment deleted");
        Ok(())
    }

    /// Who else has the recorded VF, if anyone.
    ///
    /// Records outlive the claims in `lock_dir` across a reboot, so a
    /// recorded VF may since have gone to another container. Shared-mode
    /// teardown only touches this attachment's own link and never conflicts.
    fn held_elsewhere(
        &self,
        guard: &PoolGuard<'_>,
        record: &AttachmentRecord,
    ) -> SriovResult<Option<String>> {
        let vf = &record.interface.vf;
        if record.interface.mode == BindMode::Shared {
            return Ok(None);
        }
        match guard.owner(vf)? {
            Some(owner) if owner != record.container_id => return Ok(Some(owner)),
            _ => {}
        }
        Ok(guard
            .sharers(vf)?
            .into_iter()
            .next()
            .map(|sharer| format!("{} (shared)", sharer.container_id)))
    }

    /// Drops what this container still holds in the pool records, for an
    /// ADD that died between acquiring a VF and recording the attachment.
    fn release_leftover_claims(&self, conf: &NetConf, container_id: &str, ifname: &str) {
        let vfs = match conf.deviceinfo.as_ref() {
            Some(device) => match device.resolve() {
                Ok(vf) => vec![vf],
                Err(e) => {
                    debug!(error = %e, "Cannot resolve device override for leftover claims");
                    return;
                }
            },
            None => {
                let Some(pf) = conf.master.as_deref().filter(|m| !m.is_empty()) else {
                    return;
                };
                match self.allocator.pool().inspect(pf) {
                    Ok(pf) => pf.vfs.into_iter().map(|vf| vf.id).collect(),
                    Err(e) => {
                        debug!(pf, error = %e, "Cannot inspect PF for leftover claims");
                        return;
                    }
                }
            }
        };

        for vf in &vfs {
            let released = self.allocator.lock(&vf.pf_name).and_then(|guard| {
                if guard.owner(vf)?.as_deref() == Some(container_id) {
                    guard.release(vf, container_id)?;
                }
                guard.release_shared(vf, container_id, ifname)
            });
            if let Err(e) = released {
                warn!(vf = %vf, error = %e, "Failed to release leftover claim");
            }
        }
    }
}
