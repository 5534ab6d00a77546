//! Common infrastructure for the SR-IOV CNI plugin.
//!
//! This crate provides the pieces shared by the plugin and its test
//! harness:
//!
//! - [`error`]: the error taxonomy and its CNI error codes
//! - [`shell`]: safe shell command execution with proper quoting
//!
//! # Example
//!
//! ```ignore
//! use sriov_cni_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     SriovResult,
//! };
//!
//! async fn set_up(ifname: &str) -> SriovResult<()> {
//!     let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(ifname));
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{SriovError, SriovResult};
