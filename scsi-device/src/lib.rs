//! iSCSI-backed SCSI device lifecycle
//!
//! Exports a backing file as an iSCSI target/LUN through tgtd and attaches it
//! back to the host through open-iscsi, yielding a local block device.
//!
//! This library provides:
//! - `ScsiDevice`: ordered startup/shutdown of the target and initiator session
//! - `devnode`: block device node duplication and bounded-time removal
//! - `metrics`: Prometheus metrics for the above

pub mod device;
pub mod devnode;
pub mod error;
pub mod metrics;

pub use device::ScsiDevice;
pub use error::{DevNodeError, Result, ScsiError};
