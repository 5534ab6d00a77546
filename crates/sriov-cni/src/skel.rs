//! CNI command-line surface
//!
//! The runtime passes everything through `CNI_*` environment variables and
//! the descriptor on stdin. Flags with the same names exist for manual runs.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::info;

use crate::attachment::{Attachments, CniRequest};
use crate::config::{DEFAULT_SETTINGS_PATH, SETTINGS_PATH_ENV};
use crate::result::{CniError, VersionInfo, CNI_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniCommand {
    #[value(name = "ADD")]
    Add,
    #[value(name = "DEL")]
    Del,
    #[value(name = "VERSION")]
    Version,
}

/// SR-IOV CNI plugin
#[derive(Parser, Debug, Clone)]
#[command(name = "sriov")]
#[command(author, version, about, long_about = None)]
pub struct CniArgs {
    /// Operation requested by the runtime
    #[arg(long, env = "CNI_COMMAND", value_enum, ignore_case = true)]
    pub command: CniCommand,

    /// Container identifier
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path of the container network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<PathBuf>,

    /// Interface name requested by the runtime
    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    pub ifname: String,

    /// Extra `KEY=VALUE;...` arguments, passed through to IPAM
    #[arg(long = "cni-args", env = "CNI_ARGS", default_value = "")]
    pub cni_args: String,

    /// Plugin search path
    #[arg(long, env = "CNI_PATH", value_delimiter = ':')]
    pub path: Vec<PathBuf>,

    /// Plugin settings file
    #[arg(long, env = SETTINGS_PATH_ENV, default_value = DEFAULT_SETTINGS_PATH)]
    pub config: PathBuf,
}

impl CniArgs {
    pub fn request(&self, payload: Vec<u8>) -> CniRequest {
        CniRequest {
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            ifname: self.ifname.clone(),
            args: self.cni_args.clone(),
            path: self.path.clone(),
            payload,
        }
    }
}

/// Runs one command. Returns what goes to stdout on success.
pub async fn dispatch(
    command: CniCommand,
    request: &CniRequest,
    attachments: &Attachments,
) -> SriovResult<Option<String>> {
    match command {
        CniCommand::Add => {
            let result = attachments.add(request).await?;
            Ok(Some(result.to_json()?))
        }
        CniCommand::Del => {
            attachments.del(request).await?;
            Ok(None)
        }
        CniCommand::Version => version_json().map(Some),
    }
}

pub fn version_json() -> SriovResult<String> {
    serde_json::to_string(&VersionInfo::default())
        .map_err(|e| SriovError::serialization("version info", e))
}

/// Error object for stdout, in the version the descriptor asked for.
pub fn error_json(payload: &[u8], err: &SriovError) -> String {
    let version = serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
        .unwrap_or_else(|| CNI_VERSION.to_string());
    let cni_error = CniError::from_error(version, err);
    info!(code = cni_error.code, "Reporting error to runtime");
    serde_json::to_string(&cni_error).unwrap_or_else(|_| {
        format!(
            r#"{{"cniVersion":"{}","code":{},"msg":"internal error"}}"#,
            CNI_VERSION, cni_error.code
        )
    })
}
