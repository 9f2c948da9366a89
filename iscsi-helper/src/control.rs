//! The iSCSI control surface consumed by device lifecycle code.

use std::fmt::Debug;
use std::path::Path;

use super::error::Result;
use super::executor::{CommandExecutor, NamespaceExecutor};
use super::initiator::{self, DeviceWait};
use super::net;
use super::target::{self, DaemonConfig};

/// Every iSCSI operation a device lifecycle needs, target and initiator side.
///
/// Initiator operations take the executor that carries them into the right
/// namespace; target operations run in the caller's own context.
pub trait IscsiControl: Debug + Send + Sync {
    /// Acquire an executor bound to the namespaces under `ns_dir`.
    fn namespace_executor(&self, ns_dir: &Path) -> Result<Box<dyn CommandExecutor>>;

    /// IPv4 addresses usable as a portal.
    fn local_ips(&self) -> Result<Vec<String>>;

    fn check_for_initiator_existence(&self, ne: &dyn CommandExecutor) -> Result<()>;
    fn start_daemon(&self, force: bool) -> Result<()>;

    fn create_target(&self, tid: u32, name: &str) -> Result<()>;
    fn delete_target(&self, tid: u32, name: &str) -> Result<()>;
    fn add_lun(
        &self,
        tid: u32,
        lun: u32,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
    ) -> Result<()>;
    fn delete_lun(&self, tid: u32, lun: u32) -> Result<()>;
    fn bind_initiator(&self, tid: u32, initiator: &str) -> Result<()>;
    fn unbind_initiator(&self, tid: u32, initiator: &str) -> Result<()>;

    fn discover_target(&self, portal: &str, target: &str, ne: &dyn CommandExecutor)
    -> Result<()>;
    fn delete_discovered_target(
        &self,
        portal: &str,
        target: &str,
        ne: &dyn CommandExecutor,
    ) -> Result<()>;
    fn login_target(&self, portal: &str, target: &str, ne: &dyn CommandExecutor) -> Result<()>;
    fn logout_target(&self, portal: &str, target: &str, ne: &dyn CommandExecutor) -> Result<()>;
    fn get_device(
        &self,
        portal: &str,
        target: &str,
        lun: u32,
        ne: &dyn CommandExecutor,
    ) -> Result<String>;
}

/// `IscsiControl` backed by `tgtd`/`tgtadm` and `iscsiadm`.
#[derive(Debug, Clone)]
pub struct TgtControl {
    local: NamespaceExecutor,
    daemon: DaemonConfig,
    device_wait: DeviceWait,
}

impl Default for TgtControl {
    fn default() -> Self {
        Self::new(DaemonConfig::default(), DeviceWait::default())
    }
}

impl TgtControl {
    pub fn new(daemon: DaemonConfig, device_wait: DeviceWait) -> Self {
        Self {
            local: NamespaceExecutor::direct(),
            daemon,
            device_wait,
        }
    }
}

impl IscsiControl for TgtControl {
    fn namespace_executor(&self, ns_dir: &Path) -> Result<Box<dyn CommandExecutor>> {
        Ok(Box::new(NamespaceExecutor::new(ns_dir)?))
    }

    fn local_ips(&self) -> Result<Vec<String>> {
        net::get_local_ips()
    }

    fn check_for_initiator_existence(&self, ne: &dyn CommandExecutor) -> Result<()> {
        initiator::check_for_initiator_existence(ne)
    }

    fn start_daemon(&self, force: bool) -> Result<()> {
        target::start_daemon(&self.local, force, &self.daemon)
    }

    fn create_target(&self, tid: u32, name: &str) -> Result<()> {
        target::create_target(&self.local, tid, name)
    }

    fn delete_target(&self, tid: u32, name: &str) -> Result<()> {
        target::delete_target(&self.local, tid, name)
    }

    fn add_lun(
        &self,
        tid: u32,
        lun: u32,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
    ) -> Result<()> {
        target::add_lun(&self.local, tid, lun, backing_file, bs_type, bs_opts)
    }

    fn delete_lun(&self, tid: u32, lun: u32) -> Result<()> {
        target::delete_lun(&self.local, tid, lun)
    }

    fn bind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        target::bind_initiator(&self.local, tid, initiator)
    }

    fn unbind_initiator(&self, tid: u32, initiator: &str) -> Result<()> {
        target::unbind_initiator(&self.local, tid, initiator)
    }

    fn discover_target(
        &self,
        portal: &str,
        target: &str,
        ne: &dyn CommandExecutor,
    ) -> Result<()> {
        initiator::discover_target(ne, portal, target)
    }

    fn delete_discovered_target(
        &self,
        portal: &str,
        target: &str,
        ne: &dyn CommandExecutor,
    ) -> Result<()> {
        initiator::delete_discovered_target(ne, portal, target)
    }

    fn login_target(&self, portal: &str, target: &str, ne: &dyn CommandExecutor) -> Result<()> {
        initiator::login_target(ne, portal, target)
    }

    fn logout_target(&self, portal: &str, target: &str, ne: &dyn CommandExecutor) -> Result<()> {
        initiator::logout_target(ne, portal, target)
    }

    fn get_device(
        &self,
        portal: &str,
        target: &str,
        lun: u32,
        ne: &dyn CommandExecutor,
    ) -> Result<String> {
        initiator::get_device(ne, portal, target, lun, self.device_wait)
    }
}
