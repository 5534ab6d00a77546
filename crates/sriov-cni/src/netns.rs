//! Network namespace handles and the pinned namespace worker.
//!
//! `setns(2)` switches the namespace of the calling thread only. Every
//! namespace-touching step of an invocation therefore runs on one
//! dedicated thread ([`NsWorker`]) hosting a single-threaded runtime, and a
//! [`NetNs`] handle refuses to switch from any thread other than the one
//! that opened it.

use std::fs::File;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use nix::sched::{setns, CloneFlags};
use sriov_cni_common::{SriovError, SriovResult};
use tracing::{debug, error};

/// Namespace of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
    owner: ThreadId,
}

impl NetNs {
    /// Opens the namespace at `path`.
    ///
    /// A path that does not exist yields `NamespaceNotExist`, any other
    /// failure `NamespaceOpen`.
    pub fn open(path: impl AsRef<Path>) -> SriovResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SriovError::NamespaceNotExist {
                    path: path.to_path_buf(),
                }
            } else {
                SriovError::NamespaceOpen {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            owner: thread::current().id(),
        })
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path naming this exact namespace for as long as the handle lives,
    /// usable by child processes (`ip link set ... netns <path>`).
    pub fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            self.file.as_raw_fd()
        ))
    }

    /// Switches the calling thread into this namespace until the guard is
    /// dropped.
    pub fn enter(&self) -> SriovResult<NsGuard> {
        if thread::current().id() != self.owner {
            return Err(SriovError::NamespaceOpen {
                path: self.path.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    "namespace handle used outside its owning thread",
                ),
            });
        }

        let previous = File::open(THREAD_NETNS).map_err(|e| SriovError::NamespaceOpen {
            path: PathBuf::from(THREAD_NETNS),
            source: e,
        })?;

        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|errno| SriovError::NamespaceOpen {
            path: self.path.clone(),
            source: io::Error::from(errno),
        })?;
        debug!(netns = %self.path.display(), "Entered namespace");

        Ok(NsGuard {
            previous,
            target: self.path.clone(),
            _not_send: PhantomData,
        })
    }

    /// Runs `fut` with the calling thread switched into this namespace.
    ///
    /// Child processes spawned by `fut` start inside the namespace.
    pub async fn run_in<F, T>(&self, fut: F) -> SriovResult<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.enter()?;
        Ok(fut.await)
    }
}

/// Restores the previous namespace on drop. Not `Send`: the switch belongs
/// to one thread.
#[derive(Debug)]
pub struct NsGuard {
    previous: File,
    target: PathBuf,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        match setns(&self.previous, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!(netns = %self.target.display(), "Left namespace"),
            Err(errno) => error!(
                netns = %self.target.display(),
                error = %errno,
                "Failed to restore previous namespace"
            ),
        }
    }
}

/// Dedicated thread for the namespace work of one invocation.
pub struct NsWorker;

impl NsWorker {
    pub const THREAD_NAME: &'static str = "sriov-netns";

    /// Runs the future produced by `f` to completion on a fresh thread with
    /// its own single-threaded runtime, and returns its output.
    pub fn run<F, Fut, T>(f: F) -> SriovResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T>,
        T: Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || -> SriovResult<T> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| SriovError::io(THREAD_NETNS, e))?;
                Ok(runtime.block_on(f()))
            })
            .map_err(|e| SriovError::io(THREAD_NETNS, e))?;

        handle.join().map_err(|_| {
            SriovError::io(
                THREAD_NETNS,
                io::Error::new(io::ErrorKind::Other, "namespace worker panicked"),
            )
        })?
    }
}
