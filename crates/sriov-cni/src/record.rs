//! Attachment records
//!
//! One JSON file per attachment at `<cniDir>/<containerID>-<ifname>-record`,
//! written after a successful bind and removed on teardown. It is the only
//! thing DEL needs to find the VF again after a restart.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, instrument};

use crate::binder::BoundInterface;

/// Distinguishes records from the `-ipam` handoff files in the same directory.
const RECORD_SUFFIX: &str = "record";

/// Persisted state of one attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub container_id: String,

    /// True if the VF was taken from the pool with a claim record
    #[serde(default)]
    pub claimed: bool,

    #[serde(flatten)]
    pub interface: BoundInterface,
}

impl AttachmentRecord {
    pub fn path(cni_dir: &Path, container_id: &str, ifname: &str) -> PathBuf {
        cni_dir.join(format!("{}-{}-{}", container_id, ifname, RECORD_SUFFIX))
    }

    /// Writes the record, owner-only.
    #[instrument(skip(self, cni_dir), fields(container_id = %self.container_id))]
    pub fn save(&self, cni_dir: &Path) -> SriovResult<PathBuf> {
        let path = Self::path(cni_dir, &self.container_id, &self.interface.ifname);
        let content = serde_json::to_vec(self)
            .map_err(|e| SriovError::serialization("attachment record", e))?;
        write_private_file(&path, &content)?;
        debug!(path = %path.display(), "Saved attachment record");
        Ok(path)
    }

    /// Reads the record for an attachment, if there is one.
    pub fn load(cni_dir: &Path, container_id: &str, ifname: &str) -> SriovResult<Option<Self>> {
        let path = Self::path(cni_dir, container_id, ifname);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SriovError::io(path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| SriovError::serialization("attachment record", e))
    }

    /// Deletes the record; a missing record is not an error.
    pub fn remove(cni_dir: &Path, container_id: &str, ifname: &str) -> SriovResult<()> {
        let path = Self::path(cni_dir, container_id, ifname);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SriovError::io(path, e)),
        }
    }
}

/// Creates `dir` and its parents, owner-only.
pub(crate) fn create_private_dir(dir: &Path) -> SriovResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| SriovError::io(dir, e))
}

/// Atomically replaces `path` with `content`, mode 0600. The parent
/// directory is created owner-only if absent.
pub(crate) fn write_private_file(path: &Path, content: &[u8]) -> SriovResult<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(|e| SriovError::io(&tmp, e))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| SriovError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SriovError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BindMode, VfRef};
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;

    fn record() -> AttachmentRecord {
        AttachmentRecord {
            container_id: "c0ffee".to_string(),
            claimed: true,
            interface: BoundInterface {
                vf: VfRef {
                    pci_addr: "0000:03:02.1".parse().unwrap(),
                    vf_index: 1,
                    pf_name: "enp3s0f0".to_string(),
                },
                mode: BindMode::Kernel,
                ifname: "net0".to_string(),
                host_ifname: Some("enp3s0f0v1".to_string()),
                netns: Some(PathBuf::from("/var/run/netns/cni-1")),
                vlan: 0,
                kernel_driver: None,
                dpdk_driver: None,
                dpdk_tool: None,
            },
        }
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cni_dir = dir.path().join("sriov");

        let path = record().save(&cni_dir).unwrap();
        assert_eq!(path, cni_dir.join("c0ffee-net0-record"));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(&cni_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let loaded = AttachmentRecord::load(&cni_dir, "c0ffee", "net0").unwrap();
        assert_eq!(loaded, Some(record()));

        AttachmentRecord::remove(&cni_dir, "c0ffee", "net0").unwrap();
        AttachmentRecord::remove(&cni_dir, "c0ffee", "net0").unwrap();
        assert_eq!(AttachmentRecord::load(&cni_dir, "c0ffee", "net0").unwrap(), None);
    }

    #[test]
    fn test_record_is_flat_json() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["container_id"], "c0ffee");
        assert_eq!(json["mode"], "kernel");
        assert_eq!(json["vf"]["pci_addr"], "0000:03:02.1");
    }

    #[test]
    fn test_record_never_shadows_handoff_file() {
        let dir = tempfile::tempdir().unwrap();
        let handoff = crate::ipam::handoff_path(dir.path(), "c0ffee", "net0");
        let mut rec = record();
        rec.interface.ifname = "net0-ipam".to_string();

        let path = rec.save(dir.path()).unwrap();
        assert_ne!(path, handoff);
        assert!(!handoff.exists());
    }

    #[test]
    fn test_load_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("c0ffee-net0-record"), b"{").unwrap();
        let err = AttachmentRecord::load(dir.path(), "c0ffee", "net0").unwrap_err();
        assert!(matches!(err, SriovError::Serialization { .. }));
    }
}
