//! Verification helpers for attachment tests
//!
//! Assertions over what an invocation leaves behind on the node: claim
//! records, attachment records, handoff files and VF pool state.

use std::path::PathBuf;

use sriov_cni::allocator::VfAllocator;
use sriov_cni::ipam::handoff_path;
use sriov_cni::record::AttachmentRecord;
use sriov_cni::VfState;
use sriov_cni_common::SriovError;
use thiserror::Error;

use crate::fixtures::FakeNode;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Plugin error: {0}")]
    Plugin(#[from] SriovError),

    #[error("Expected {expected} free VFs on {pf}, found {actual}")]
    FreeCountMismatch {
        pf: String,
        expected: usize,
        actual: usize,
    },

    #[error("VF {index} of {pf}: expected {expected}, found {actual}")]
    StateMismatch {
        pf: String,
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Expected file {path:?} exists={exists}")]
    FilePresence { path: PathBuf, exists: bool },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Node state verifier
pub struct NodeVerifier<'a> {
    node: &'a FakeNode,
    allocator: VfAllocator,
}

impl<'a> NodeVerifier<'a> {
    pub fn new(node: &'a FakeNode) -> Self {
        Self {
            node,
            allocator: VfAllocator::new(&node.settings),
        }
    }

    /// Number of VFs currently allocatable on the node's PF
    pub fn free_count(&self) -> VerifyResult<usize> {
        Ok(self.allocator.pool().inspect(&self.node.pf)?.free_count())
    }

    /// Verify the number of free VFs
    pub fn assert_free_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.free_count()?;
        if actual != expected {
            return Err(VerificationError::FreeCountMismatch {
                pf: self.node.pf.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify the derived state of VF `index`
    pub fn assert_vf_state(&self, index: u32, expected: VfState) -> VerifyResult<()> {
        let pf = self.allocator.pool().inspect(&self.node.pf)?;
        let actual = pf
            .vfs
            .iter()
            .find(|vf| vf.id.vf_index == index)
            .map(|vf| format!("{:?}", vf.state))
            .unwrap_or_else(|| "missing".to_string());
        let expected = format!("{:?}", expected);
        if actual != expected {
            return Err(VerificationError::StateMismatch {
                pf: self.node.pf.clone(),
                index,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify who holds the claim on VF `index`
    pub fn assert_owner(&self, index: u32, expected: Option<&str>) -> VerifyResult<()> {
        let actual = self.allocator.claims().owner(&self.node.pf, index)?;
        if actual.as_deref() != expected {
            return Err(VerificationError::StateMismatch {
                pf: self.node.pf.clone(),
                index,
                expected: format!("owner {:?}", expected),
                actual: format!("owner {:?}", actual),
            });
        }
        Ok(())
    }

    /// Verify whether an attachment record exists
    pub fn assert_record(&self, container_id: &str, ifname: &str, exists: bool) -> VerifyResult<()> {
        let found = AttachmentRecord::load(&self.node.cni_dir(), container_id, ifname)?.is_some();
        if found != exists {
            return Err(VerificationError::FilePresence {
                path: AttachmentRecord::path(&self.node.cni_dir(), container_id, ifname),
                exists,
            });
        }
        Ok(())
    }

    /// Verify whether the DPDK handoff file exists
    pub fn assert_handoff(&self, container_id: &str, ifname: &str, exists: bool) -> VerifyResult<()> {
        let path = handoff_path(&self.node.cni_dir(), container_id, ifname);
        if path.exists() != exists {
            return Err(VerificationError::FilePresence { path, exists });
        }
        Ok(())
    }
}
