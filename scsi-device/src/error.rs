use std::path::PathBuf;

use iscsi_helper::IscsiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScsiError {
    #[error("no local address available for the iSCSI portal")]
    Resolution,

    #[error("SCSI device is already down")]
    AlreadyDown,

    #[error("SCSI device is already up at {0}")]
    AlreadyUp(String),

    #[error(transparent)]
    Iscsi(#[from] IscsiError),
}

pub type Result<T> = std::result::Result<T, ScsiError>;

#[derive(Error, Debug)]
pub enum DevNodeError {
    #[error("device '{0}' not found")]
    NotFound(PathBuf),

    #[error("failed to create device node '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to stat '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to remove device '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout trying to delete '{0}'")]
    Timeout(PathBuf),

    #[error("removal of '{0}' ended without reporting a result")]
    WorkerLost(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
