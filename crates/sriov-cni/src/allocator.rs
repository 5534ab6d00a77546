//! VF allocator
//!
//! Allocation is serialised per PF with an exclusive `flock(2)` on
//! `<lock_dir>/<pf>.lock`. While the lock is held the pool is inspected, the
//! first free VF is picked and a claim record `<lock_dir>/<pf>/vf<N>.claim`
//! is written. The claim keeps the VF out of later scans until its netdev
//! leaves the host namespace, and until teardown removes it.
//!
//! Shared-mode attachments leave the VF in the host and instead list
//! themselves in `<lock_dir>/<pf>/vf<N>.shared`. A VF with sharers is never
//! handed out exclusively; the file goes away with its last sharer.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, info, instrument, warn};

use crate::config::PluginSettings;
use crate::inspector::DevicePool;
use crate::record::{create_private_dir, write_private_file};
use crate::types::{PciAddress, VfRef, VfState, VirtualFunction};

/// Owner reported for a claim record that cannot be decoded.
pub const UNKNOWN_OWNER: &str = "unknown";

/// Contents of a claim record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub container_id: String,
    pub pci_addr: PciAddress,
}

/// One shared-mode attachment riding on a VF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sharer {
    pub container_id: String,
    pub ifname: String,
}

/// Contents of a shared-use record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SharedUse {
    pci_addr: PciAddress,
    sharers: Vec<Sharer>,
}

/// Claim and shared-use records on disk
#[derive(Debug, Clone)]
pub struct ClaimStore {
    root: PathBuf,
}

impl ClaimStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn lock_path(&self, pf: &str) -> PathBuf {
        self.root.join(format!("{}.lock", pf))
    }

    pub fn claim_path(&self, pf: &str, vf_index: u32) -> PathBuf {
        self.root.join(pf).join(format!("vf{}.claim", vf_index))
    }

    pub fn shared_path(&self, pf: &str, vf_index: u32) -> PathBuf {
        self.root.join(pf).join(format!("vf{}.shared", vf_index))
    }

    /// Container holding the claim on a VF, if any.
    ///
    /// An undecodable record still counts as a claim, owned by
    /// [`UNKNOWN_OWNER`].
    pub fn owner(&self, pf: &str, vf_index: u32) -> SriovResult<Option<String>> {
        let path = self.claim_path(pf, vf_index);
        let Some(content) = read_optional(&path)? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Claim>(&content) {
            Ok(claim) => Ok(Some(claim.container_id)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt claim record");
                Ok(Some(UNKNOWN_OWNER.to_string()))
            }
        }
    }

    /// Shared-mode attachments using a VF. An undecodable record counts as
    /// one sharer owned by [`UNKNOWN_OWNER`].
    pub fn sharers(&self, pf: &str, vf_index: u32) -> SriovResult<Vec<Sharer>> {
        let path = self.shared_path(pf, vf_index);
        let Some(content) = read_optional(&path)? else {
            return Ok(Vec::new());
        };

        match serde_json::from_slice::<SharedUse>(&content) {
            Ok(shared) => Ok(shared.sharers),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt shared-use record");
                Ok(vec![Sharer {
                    container_id: UNKNOWN_OWNER.to_string(),
                    ifname: String::new(),
                }])
            }
        }
    }

    fn write(&self, vf: &VfRef, container_id: &str) -> SriovResult<()> {
        let claim = Claim {
            container_id: container_id.to_string(),
            pci_addr: vf.pci_addr.clone(),
        };
        let content =
            serde_json::to_vec(&claim).map_err(|e| SriovError::serialization("claim", e))?;
        write_private_file(&self.claim_path(&vf.pf_name, vf.vf_index), &content)
    }

    fn remove(&self, pf: &str, vf_index: u32) -> SriovResult<()> {
        remove_optional(&self.claim_path(pf, vf_index))
    }

    fn write_sharers(&self, vf: &VfRef, sharers: Vec<Sharer>) -> SriovResult<()> {
        let path = self.shared_path(&vf.pf_name, vf.vf_index);
        if sharers.is_empty() {
            return remove_optional(&path);
        }
        let shared = SharedUse {
            pci_addr: vf.pci_addr.clone(),
            sharers,
        };
        let content = serde_json::to_vec(&shared)
            .map_err(|e| SriovError::serialization("shared-use record", e))?;
        write_private_file(&path, &content)
    }
}

fn read_optional(path: &Path) -> SriovResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SriovError::io(path, e)),
    }
}

fn remove_optional(path: &Path) -> SriovResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SriovError::io(path, e)),
    }
}

/// Exclusive hold on a PF's pool. Released on drop.
#[derive(Debug)]
pub struct PoolLock {
    _file: Flock<File>,
}

impl PoolLock {
    /// Blocks until the lock on `path` is acquired.
    pub fn acquire(path: &Path) -> SriovResult<Self> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| SriovError::io(path, e))?;

        let file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            SriovError::Lock {
                path: path.to_path_buf(),
                message: errno.desc().to_string(),
            }
        })?;

        debug!(path = %path.display(), "Acquired pool lock");
        Ok(Self { _file: file })
    }
}

/// A PF's claims, read and changed under its pool lock.
///
/// Teardown holds one of these while it touches the VF, so no other
/// invocation can hand the VF out halfway through.
#[derive(Debug)]
pub struct PoolGuard<'a> {
    _lock: PoolLock,
    claims: &'a ClaimStore,
}

impl PoolGuard<'_> {
    pub fn owner(&self, vf: &VfRef) -> SriovResult<Option<String>> {
        self.claims.owner(&vf.pf_name, vf.vf_index)
    }

    pub fn sharers(&self, vf: &VfRef) -> SriovResult<Vec<Sharer>> {
        self.claims.sharers(&vf.pf_name, vf.vf_index)
    }

    /// Drops the claim `container_id` holds on `vf`.
    ///
    /// Missing claims are a no-op. A claim held by another container is
    /// left alone.
    pub fn release(&self, vf: &VfRef, container_id: &str) -> SriovResult<()> {
        match self.owner(vf)? {
            None => {
                debug!(vf = %vf, "No claim to release");
                Ok(())
            }
            Some(owner) if owner != container_id => {
                warn!(
                    vf = %vf,
                    owner = %owner,
                    container_id,
                    "VF is claimed by another container, leaving it"
                );
                Ok(())
            }
            Some(_) => {
                self.claims.remove(&vf.pf_name, vf.vf_index)?;
                info!(vf = %vf, container_id, "Released VF");
                Ok(())
            }
        }
    }

    /// Removes one shared-mode attachment from `vf`.
    pub fn release_shared(&self, vf: &VfRef, container_id: &str, ifname: &str) -> SriovResult<()> {
        let mut sharers = self.sharers(vf)?;
        let before = sharers.len();
        sharers.retain(|s| !(s.container_id == container_id && s.ifname == ifname));
        if sharers.len() == before {
            debug!(vf = %vf, "No shared use to release");
            return Ok(());
        }
        let left = sharers.len();
        self.claims.write_sharers(vf, sharers)?;
        info!(vf = %vf, container_id, left, "Released shared use");
        Ok(())
    }

    fn add_sharer(&self, vf: &VfRef, container_id: &str, ifname: &str) -> SriovResult<()> {
        let mut sharers = self.sharers(vf)?;
        if !sharers
            .iter()
            .any(|s| s.container_id == container_id && s.ifname == ifname)
        {
            sharers.push(Sharer {
                container_id: container_id.to_string(),
                ifname: ifname.to_string(),
            });
        }
        let count = sharers.len();
        self.claims.write_sharers(vf, sharers)?;
        info!(vf = %vf, container_id, sharers = count, "Sharing VF");
        Ok(())
    }
}

/// Hands out VFs from a PF pool
#[derive(Debug, Clone)]
pub struct VfAllocator {
    pool: DevicePool,
    claims: ClaimStore,
}

impl VfAllocator {
    pub fn new(settings: &PluginSettings) -> Self {
        Self {
            pool: DevicePool::new(settings),
            claims: ClaimStore::new(&settings.lock_dir),
        }
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn claims(&self) -> &ClaimStore {
        &self.claims
    }

    /// Takes the pool lock of `pf`.
    pub fn lock(&self, pf: &str) -> SriovResult<PoolGuard<'_>> {
        Ok(PoolGuard {
            _lock: PoolLock::acquire(&self.claims.lock_path(pf))?,
            claims: &self.claims,
        })
    }

    /// Claims the first free VF of `pf` for `container_id`.
    #[instrument(skip(self))]
    pub fn allocate(&self, pf: &str, container_id: &str) -> SriovResult<VirtualFunction> {
        let _guard = self.lock(pf)?;

        let pool = self.pool.inspect(pf)?;
        let Some(vf) = pool.first_free().cloned() else {
            warn!(pf, vfs = pool.vfs.len(), "No free VF left");
            return Err(SriovError::ResourceExhausted { pf: pf.to_string() });
        };

        self.claims.write(&vf.id, container_id)?;
        info!(vf = %vf.id, container_id, "Claimed VF");

        Ok(VirtualFunction {
            owner: Some(container_id.to_string()),
            ..vf
        })
    }

    /// Claims a VF named by the caller.
    ///
    /// The VF is not checked for availability. Returns false, writing
    /// nothing, when another container already holds the claim.
    #[instrument(skip(self, vf), fields(vf = %vf))]
    pub fn claim(&self, vf: &VfRef, container_id: &str) -> SriovResult<bool> {
        let guard = self.lock(&vf.pf_name)?;

        match guard.owner(vf)? {
            Some(owner) if owner != container_id => {
                warn!(owner = %owner, container_id, "VF is already claimed, using it unclaimed");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                self.claims.write(vf, container_id)?;
                info!(container_id, "Claimed VF");
                Ok(true)
            }
        }
    }

    /// Drops the claim `container_id` holds on `vf`.
    #[instrument(skip(self, vf), fields(vf = %vf))]
    pub fn release(&self, vf: &VfRef, container_id: &str) -> SriovResult<()> {
        self.lock(&vf.pf_name)?.release(vf, container_id)
    }

    /// Picks a VF for a shared-mode attachment and records the use.
    ///
    /// A VF that is already shared is preferred over a free one.
    #[instrument(skip(self))]
    pub fn select_shared(
        &self,
        pf: &str,
        container_id: &str,
        ifname: &str,
    ) -> SriovResult<VirtualFunction> {
        let guard = self.lock(pf)?;

        let pool = self.pool.inspect(pf)?;
        let vf = pool
            .vfs
            .iter()
            .find(|vf| vf.state == VfState::Shared)
            .or_else(|| pool.first_free())
            .cloned()
            .ok_or_else(|| SriovError::ResourceExhausted { pf: pf.to_string() })?;

        guard.add_sharer(&vf.id, container_id, ifname)?;
        Ok(VirtualFunction {
            state: VfState::Shared,
            ..vf
        })
    }

    /// Records a shared-mode attachment on a VF named by the caller.
    #[instrument(skip(self, vf), fields(vf = %vf))]
    pub fn share(&self, vf: &VfRef, container_id: &str, ifname: &str) -> SriovResult<()> {
        self.lock(&vf.pf_name)?.add_sharer(vf, container_id, ifname)
    }

    /// Removes one shared-mode attachment from `vf`.
    #[instrument(skip(self, vf), fields(vf = %vf))]
    pub fn release_shared(&self, vf: &VfRef, container_id: &str, ifname: &str) -> SriovResult<()> {
        self.lock(&vf.pf_name)?
            .release_shared(vf, container_id, ifname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SysfsTree;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_allocate_first_free_in_order() {
        let tree = SysfsTree::new("enp3s0f0", 3);
        let allocator = VfAllocator::new(&tree.settings);

        let first = allocator.allocate("enp3s0f0", "c1").unwrap();
        let second = allocator.allocate("enp3s0f0", "c2").unwrap();
        assert_eq!(first.id.vf_index, 0);
        assert_eq!(second.id.vf_index, 1);
        assert_eq!(first.owner.as_deref(), Some("c1"));

        let pf = allocator.pool().inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs[0].state, VfState::Claimed);
        assert_eq!(pf.vfs[0].owner.as_deref(), Some("c1"));
        assert_eq!(pf.free_count(), 1);
    }

    #[test]
    fn test_allocate_exhausted() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);

        allocator.allocate("enp3s0f0", "c1").unwrap();
        let err = allocator.allocate("enp3s0f0", "c2").unwrap_err();
        assert!(matches!(err, SriovError::ResourceExhausted { ref pf } if pf == "enp3s0f0"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);

        let vf = allocator.allocate("enp3s0f0", "c1").unwrap();
        allocator.release(&vf.id, "c1").unwrap();
        allocator.release(&vf.id, "c1").unwrap();

        let again = allocator.allocate("enp3s0f0", "c2").unwrap();
        assert_eq!(again.id, vf.id);
    }

    #[test]
    fn test_release_keeps_foreign_claim() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);

        let vf = allocator.allocate("enp3s0f0", "c1").unwrap();
        allocator.release(&vf.id, "c2").unwrap();

        assert_eq!(
            allocator.claims().owner("enp3s0f0", 0).unwrap().as_deref(),
            Some("c1")
        );
    }

    #[test]
    fn test_corrupt_claim_still_counts() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);
        let path = allocator.claims().claim_path("enp3s0f0", 0);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();

        assert_eq!(
            allocator.claims().owner("enp3s0f0", 0).unwrap().as_deref(),
            Some(UNKNOWN_OWNER)
        );
        assert!(allocator.allocate("enp3s0f0", "c1").is_err());
    }

    #[test]
    fn test_shared_vf_is_reused_and_never_allocated() {
        let tree = SysfsTree::new("enp3s0f0", 2);
        let allocator = VfAllocator::new(&tree.settings);

        let vf = allocator.select_shared("enp3s0f0", "c1", "net0").unwrap();
        assert_eq!(vf.id.vf_index, 0);
        assert!(allocator.claims().owner("enp3s0f0", 0).unwrap().is_none());
        assert_eq!(
            allocator.select_shared("enp3s0f0", "c2", "net0").unwrap().id,
            vf.id
        );
        assert_eq!(allocator.claims().sharers("enp3s0f0", 0).unwrap().len(), 2);

        let pf = allocator.pool().inspect("enp3s0f0").unwrap();
        assert_eq!(pf.vfs[0].state, VfState::Shared);
        assert_eq!(pf.free_count(), 1);

        let exclusive = allocator.allocate("enp3s0f0", "c3").unwrap();
        assert_eq!(exclusive.id.vf_index, 1);
        assert!(allocator.allocate("enp3s0f0", "c4").is_err());
    }

    #[test]
    fn test_last_sharer_frees_the_vf() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);

        let vf = allocator.select_shared("enp3s0f0", "c1", "net0").unwrap();
        allocator.select_shared("enp3s0f0", "c1", "net1").unwrap();

        allocator.release_shared(&vf.id, "c1", "net0").unwrap();
        assert_eq!(
            allocator.pool().inspect("enp3s0f0").unwrap().vfs[0].state,
            VfState::Shared
        );

        allocator.release_shared(&vf.id, "c1", "net1").unwrap();
        allocator.release_shared(&vf.id, "c1", "net1").unwrap();
        assert!(!allocator.claims().shared_path("enp3s0f0", 0).exists());
        assert_eq!(allocator.allocate("enp3s0f0", "c2").unwrap().id, vf.id);
    }

    #[test]
    fn test_claim_named_vf() {
        let tree = SysfsTree::new("enp3s0f0", 2);
        let allocator = VfAllocator::new(&tree.settings);
        let vf = VfRef {
            pci_addr: SysfsTree::pci_addr(1).parse().unwrap(),
            vf_index: 1,
            pf_name: "enp3s0f0".to_string(),
        };

        assert!(allocator.claim(&vf, "c1").unwrap());
        assert!(allocator.claim(&vf, "c1").unwrap());
        assert!(!allocator.claim(&vf, "c2").unwrap());
        assert_eq!(
            allocator.claims().owner("enp3s0f0", 1).unwrap().as_deref(),
            Some("c1")
        );
        assert_eq!(allocator.allocate("enp3s0f0", "c3").unwrap().id.vf_index, 0);
        assert!(allocator.allocate("enp3s0f0", "c4").is_err());
    }

    #[test]
    fn test_guard_releases_without_relocking() {
        let tree = SysfsTree::new("enp3s0f0", 1);
        let allocator = VfAllocator::new(&tree.settings);
        let vf = allocator.allocate("enp3s0f0", "c1").unwrap();

        let guard = allocator.lock("enp3s0f0").unwrap();
        assert_eq!(guard.owner(&vf.id).unwrap().as_deref(), Some("c1"));
        guard.release(&vf.id, "c1").unwrap();
        assert_eq!(guard.owner(&vf.id).unwrap(), None);
    }

    #[test]
    fn test_concurrent_allocators_never_share_a_vf() {
        const POOL: usize = 8;
        const CALLERS: usize = 12;

        let tree = SysfsTree::new("enp3s0f0", POOL as u32);
        let settings = tree.settings.clone();
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let settings = settings.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    // Each thread has its own allocator and its own lock fd.
                    let allocator = VfAllocator::new(&settings);
                    barrier.wait();
                    allocator
                        .allocate("enp3s0f0", &format!("container-{}", i))
                        .ok()
                        .map(|vf| vf.id.vf_index)
                })
            })
            .collect();

        let won: Vec<u32> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u32> = won.iter().copied().collect();

        assert_eq!(won.len(), POOL);
        assert_eq!(unique.len(), POOL);
    }
}
