//! Error types for SR-IOV attachment operations.
//!
//! This module defines the error taxonomy shared by every crate in the
//! workspace. All errors implement `std::error::Error` via `thiserror`, and
//! each variant maps onto a CNI error code so the dispatch shell can report
//! it to the container runtime unchanged.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for SR-IOV operations.
pub type SriovResult<T> = Result<T, SriovError>;

/// CNI error code for an invalid or incompatible network configuration.
pub const CNI_CODE_INVALID_CONFIG: u32 = 7;

/// CNI error code for an I/O failure.
pub const CNI_CODE_IO: u32 = 5;

/// Errors that can occur while attaching or detaching a VF.
#[derive(Debug, Error)]
pub enum SriovError {
    /// The network attachment descriptor is malformed or incomplete.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// The namespace path exists but could not be opened or entered.
    #[error("Failed to open netns {path:?}: {source}")]
    NamespaceOpen {
        /// Namespace path handed to the plugin.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The namespace path does not exist.
    #[error("Netns {path:?} does not exist")]
    NamespaceNotExist {
        /// Namespace path handed to the plugin.
        path: PathBuf,
    },

    /// The physical function has no free virtual function left.
    #[error("No free VF available on PF '{pf}'")]
    ResourceExhausted {
        /// The physical function that was scanned.
        pf: String,
    },

    /// An explicit device override lacks one of its mandatory fields.
    #[error("Device information is incomplete: missing {missing}")]
    DeviceMissingFields {
        /// Comma separated list of the missing fields.
        missing: String,
    },

    /// The physical function or its device registry could not be read.
    #[error("Failed to query device '{device}': {message}")]
    DeviceQuery {
        /// The device (PF name or PCI address) being inspected.
        device: String,
        /// Error message.
        message: String,
    },

    /// A kernel or userspace driver transition failed.
    #[error("Failed to bind {pci_addr} to driver '{driver}': {message}")]
    DriverBind {
        /// The VF PCI address.
        pci_addr: String,
        /// The driver that was requested.
        driver: String,
        /// Error message.
        message: String,
    },

    /// The IPAM backend returned no usable primary address.
    #[error("IPAM plugin '{plugin}' returned missing IPv4 config")]
    AddressConfigMissing {
        /// IPAM plugin type.
        plugin: String,
    },

    /// The IPAM backend could not be executed or reported an error.
    #[error("IPAM plugin '{plugin}' failed: {message}")]
    AddressBackend {
        /// IPAM plugin type.
        plugin: String,
        /// CNI error code reported by the backend, if any.
        code: Option<u32>,
        /// Error message.
        message: String,
    },

    /// Moving or renaming the VF interface failed.
    #[error("Failed to set up interface '{ifname}': {message}")]
    InterfaceBind {
        /// The interface being moved or renamed.
        ifname: String,
        /// Error message.
        message: String,
    },

    /// The per-PF pool lock could not be taken.
    #[error("Failed to lock VF pool {path:?}: {message}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Failed to encode or decode a JSON payload.
    #[error("Failed to (de)serialize {what}: {source}")]
    Serialization {
        /// What was being (de)serialized.
        what: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// IO error on a file the plugin owns.
    #[error("IO error on {path:?}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl SriovError {
    /// Creates an invalid configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a device query error.
    pub fn device_query(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceQuery {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a driver bind error.
    pub fn driver_bind(
        pci_addr: impl Into<String>,
        driver: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DriverBind {
            pci_addr: pci_addr.into(),
            driver: driver.into(),
            message: message.into(),
        }
    }

    /// Creates an interface bind error.
    pub fn interface_bind(ifname: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InterfaceBind {
            ifname: ifname.into(),
            message: message.into(),
        }
    }

    /// Creates an IPAM backend error without a backend supplied code.
    pub fn address_backend(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AddressBackend {
            plugin: plugin.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Creates an IO error tagged with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a (de)serialization error.
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            what: what.into(),
            source,
        }
    }

    /// Returns the CNI error code reported to the runtime.
    pub fn code(&self) -> u32 {
        match self {
            SriovError::Config { .. } | SriovError::Serialization { .. } => {
                CNI_CODE_INVALID_CONFIG
            }
            SriovError::NamespaceOpen { .. } => 100,
            SriovError::NamespaceNotExist { .. } => 101,
            SriovError::ResourceExhausted { .. } => 102,
            SriovError::DeviceMissingFields { .. } => 103,
            SriovError::DriverBind { .. } => 104,
            SriovError::AddressConfigMissing { .. } => 105,
            SriovError::AddressBackend { code, .. } => code.unwrap_or(106),
            SriovError::InterfaceBind { .. } => 107,
            SriovError::DeviceQuery { .. } => 108,
            SriovError::Lock { .. }
            | SriovError::ShellExec { .. }
            | SriovError::ShellCommandFailed { .. }
            | SriovError::Io { .. } => CNI_CODE_IO,
        }
    }

    /// Returns true if teardown may treat this error as "already gone".
    pub fn is_namespace_missing(&self) -> bool {
        matches!(self, SriovError::NamespaceNotExist { .. })
    }
}
