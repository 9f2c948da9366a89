use thiserror::Error;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("iSCSI initiator is not available: {0}")]
    InitiatorMissing(String),

    #[error("tgtd did not become ready after {0} attempts")]
    DaemonNotReady(u32),

    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("target '{target}' not discovered at portal {portal}")]
    TargetNotDiscovered { portal: String, target: String },

    #[error("no device attached for target '{target}' lun {lun} at portal {portal}")]
    DeviceNotFound {
        portal: String,
        target: String,
        lun: u32,
    },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("failed to enumerate local addresses: {0}")]
    Address(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IscsiError>;
