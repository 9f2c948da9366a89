//! iSCSI control surface
//!
//! Thin wrappers over the Linux SCSI target framework (`tgtd`/`tgtadm`) and
//! open-iscsi (`iscsiadm`), plus a namespace-aware command executor so that
//! initiator commands can run in the host's mount/network namespace.
//!
//! The library is split into several modules:
//! - `executor`: command execution, optionally through `nsenter`
//! - `target`: target daemon, target, LUN and ACL management
//! - `initiator`: discovery, login/logout and attached device lookup
//! - `net`: local address enumeration for portal selection
//! - `control`: the `IscsiControl` trait tying all of the above together

pub mod control;
pub mod error;
pub mod executor;
pub mod initiator;
pub mod net;
pub mod target;

pub use control::{IscsiControl, TgtControl};
pub use error::{IscsiError, Result};
pub use executor::{CommandExecutor, NamespaceExecutor};
