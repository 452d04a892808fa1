mod archiver;
mod events;
mod fs_stat;
mod mirror;
mod monitor;
pub mod paths;
mod peer_fs;
mod syncer;
mod writer;

#[cfg(test)]
mod peer_fs_tests;

pub use archiver::{is_version_folder_name, is_version_path, version_folder, VersionArchiver};
pub use events::{BusHandle, EventBus, FsEvent, FsEventListener, COMPLETE_WRITE_EVENT};
pub use fs_stat::{FsStat, FsStatConfig, FsStatSnapshot, ResizeOnPeerMapChange};
pub use mirror::{FileStat, Mirror, MirrorRef, Node, NodeId, NodeKind, NodeType, ROOT_ID};
pub use monitor::{FileMonitor, MonitorConfig};
pub use peer_fs::{start_peer_fs, PeerFs, PeerFsHandles};
pub use syncer::{DhtSyncer, SyncTriggerListener};
pub use writer::WriteBackListener;

use thiserror::Error;

/// Kernel-visible failure of a filesystem operation. Converted to a negative
/// errno at the VFS boundary; never retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
