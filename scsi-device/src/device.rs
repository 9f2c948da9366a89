//! A single file-backed iSCSI export attached back to the local host.
//!
//! `ScsiDevice::startup` creates a target and LUN over the backing file,
//! opens it to all initiators, then discovers and logs into it from the host
//! so the kernel exposes a local block device. `shutdown` undoes this in
//! reverse. Neither call rolls back on failure; see the method docs.
//!
//! A `ScsiDevice` does no locking of its own. Callers must serialize
//! `startup`/`shutdown` on an instance, and since every device uses target id
//! `TARGET_ID`, only one device may be attached per host at a time.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use iscsi_helper::IscsiControl;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::error::{Result, ScsiError};
use super::metrics::{self, OperationTimer};

/// Naming authority prefixed to every target name
pub const TARGET_AUTHORITY: &str = "iqn.2014-07.com.rancher";
pub const TARGET_ID: u32 = 1;
pub const LUN_ID: u32 = 1;
/// ACL entry that admits every initiator
pub const ALL_INITIATORS: &str = "ALL";
/// Namespaces of the host's init process, as mounted into the container
pub const HOST_NAMESPACE: &str = "/host/proc/1/ns/";

/// IQN of the target exported for `name`.
pub fn target_name(name: &str) -> String {
    format!("{}:{}", TARGET_AUTHORITY, name)
}

/// One step of the startup or shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AcquireExecutor,
    CheckInitiator,
    StartDaemon,
    CreateTarget,
    AddLun,
    BindInitiator,
    DiscoverTarget,
    LoginTarget,
    GetDevice,
    LogoutTarget,
    DeleteDiscoveredTarget,
    UnbindInitiator,
    DeleteLun,
    DeleteTarget,
}

impl Step {
    pub const STARTUP: [Step; 9] = [
        Step::AcquireExecutor,
        Step::CheckInitiator,
        Step::StartDaemon,
        Step::CreateTarget,
        Step::AddLun,
        Step::BindInitiator,
        Step::DiscoverTarget,
        Step::LoginTarget,
        Step::GetDevice,
    ];

    pub const SHUTDOWN: [Step; 7] = [
        Step::AcquireExecutor,
        Step::CheckInitiator,
        Step::LogoutTarget,
        Step::DeleteDiscoveredTarget,
        Step::UnbindInitiator,
        Step::DeleteLun,
        Step::DeleteTarget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::AcquireExecutor => "acquire_executor",
            Step::CheckInitiator => "check_initiator",
            Step::StartDaemon => "start_daemon",
            Step::CreateTarget => "create_target",
            Step::AddLun => "add_lun",
            Step::BindInitiator => "bind_initiator",
            Step::DiscoverTarget => "discover_target",
            Step::LoginTarget => "login_target",
            Step::GetDevice => "get_device",
            Step::LogoutTarget => "logout_target",
            Step::DeleteDiscoveredTarget => "delete_discovered_target",
            Step::UnbindInitiator => "unbind_initiator",
            Step::DeleteLun => "delete_lun",
            Step::DeleteTarget => "delete_target",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run one named step, passing its error through untouched.
fn run_step<T>(step: Step, f: impl FnOnce() -> iscsi_helper::Result<T>) -> Result<T> {
    debug!(step = %step, "Running step");
    f().map_err(|e| {
        warn!(step = %step, error = %e, "Step failed");
        ScsiError::Iscsi(e)
    })
}

/// A provisioned iSCSI target+LUN and the initiator session attached to it.
///
/// Not `Clone`: a copy would carry its own attached flag and could log out
/// a second time.
///
/// ```compile_fail
/// fn assert_clone<T: Clone>() {}
/// assert_clone::<scsi_device::ScsiDevice>();
/// ```
#[derive(Debug, Serialize)]
pub struct ScsiDevice {
    target: String,
    target_id: u32,
    lun_id: u32,
    /// Local block device while attached, empty otherwise
    device: String,
    portal: String,
    backing_file: String,
    bs_type: String,
    bs_opts: String,
    #[serde(skip)]
    ns_dir: PathBuf,
    #[serde(skip)]
    control: Arc<dyn IscsiControl>,
}

impl ScsiDevice {
    /// Describe the export for `name`, using the first local address as portal.
    pub fn new(
        name: &str,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
        control: Arc<dyn IscsiControl>,
    ) -> Result<Self> {
        let ips = control.local_ips()?;
        Self::with_portal(name, backing_file, bs_type, bs_opts, ips, control)
    }

    /// Like `new`, with the candidate portal addresses supplied by the caller.
    /// The first entry becomes the portal; an empty list is a `Resolution` error.
    pub fn with_portal(
        name: &str,
        backing_file: &str,
        bs_type: &str,
        bs_opts: &str,
        ips: Vec<String>,
        control: Arc<dyn IscsiControl>,
    ) -> Result<Self> {
        let portal = ips.into_iter().next().ok_or(ScsiError::Resolution)?;

        Ok(Self {
            target: target_name(name),
            target_id: TARGET_ID,
            lun_id: LUN_ID,
            device: String::new(),
            portal,
            backing_file: backing_file.to_string(),
            bs_type: bs_type.to_string(),
            bs_opts: bs_opts.to_string(),
            ns_dir: PathBuf::from(HOST_NAMESPACE),
            control,
        })
    }

    /// Run initiator commands in the namespaces under `ns_dir` instead of
    /// `HOST_NAMESPACE`. An empty path runs them in the current namespaces.
    pub fn with_namespace(mut self, ns_dir: impl Into<PathBuf>) -> Self {
        self.ns_dir = ns_dir.into();
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_id(&self) -> u32 {
        self.target_id
    }

    pub fn lun_id(&self) -> u32 {
        self.lun_id
    }

    pub fn portal(&self) -> &str {
        &self.portal
    }

    pub fn backing_file(&self) -> &str {
        &self.backing_file
    }

    pub fn bs_type(&self) -> &str {
        &self.bs_type
    }

    pub fn bs_opts(&self) -> &str {
        &self.bs_opts
    }

    pub fn ns_dir(&self) -> &Path {
        &self.ns_dir
    }

    /// Attached block device path, empty when not attached.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_attached(&self) -> bool {
        !self.device.is_empty()
    }

    /// Create the target and LUN, then log in from the host and record the
    /// resulting block device.
    ///
    /// The first failing step's error is returned as is. Steps that already
    /// succeeded are not undone, so a failed startup can leave the target,
    /// LUN, ACL or node record behind. `device` is only set once every step
    /// has succeeded.
    #[instrument(skip(self), fields(iqn = %self.target, portal = %self.portal))]
    pub fn startup(&mut self) -> Result<()> {
        if self.is_attached() {
            return Err(ScsiError::AlreadyUp(self.device.clone()));
        }

        let timer = OperationTimer::new("startup");
        let device = timer.finish(self.attach())?;

        info!(device = %device, "SCSI device attached");
        self.device = device;
        metrics::set_attached(&self.target, true);
        Ok(())
    }

    fn attach(&self) -> Result<String> {
        let control = self.control.as_ref();

        let ne = run_step(Step::AcquireExecutor, || {
            control.namespace_executor(&self.ns_dir)
        })?;
        run_step(Step::CheckInitiator, || {
            control.check_for_initiator_existence(ne.as_ref())
        })?;

        // Target side
        run_step(Step::StartDaemon, || control.start_daemon(false))?;
        run_step(Step::CreateTarget, || {
            control.create_target(self.target_id, &self.target)
        })?;
        run_step(Step::AddLun, || {
            control.add_lun(
                self.target_id,
                self.lun_id,
                &self.backing_file,
                &self.bs_type,
                &self.bs_opts,
            )
        })?;
        run_step(Step::BindInitiator, || {
            control.bind_initiator(self.target_id, ALL_INITIATORS)
        })?;

        // Initiator side
        run_step(Step::DiscoverTarget, || {
            control.discover_target(&self.portal, &self.target, ne.as_ref())
        })?;
        run_step(Step::LoginTarget, || {
            control.login_target(&self.portal, &self.target, ne.as_ref())
        })?;
        run_step(Step::GetDevice, || {
            control.get_device(&self.portal, &self.target, self.lun_id, ne.as_ref())
        })
    }

    /// Log out, then remove the node record, ACL, LUN and target.
    ///
    /// Fails with `AlreadyDown` when not attached. `device` is cleared as soon
    /// as logout succeeds, so an error from a later cleanup step still leaves
    /// the device detached.
    #[instrument(skip(self), fields(iqn = %self.target, portal = %self.portal))]
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.is_attached() {
            return Err(ScsiError::AlreadyDown);
        }

        let timer = OperationTimer::new("shutdown");
        let result = self.detach();
        timer.finish(result)
    }

    fn detach(&mut self) -> Result<()> {
        let control = Arc::clone(&self.control);

        let ne = run_step(Step::AcquireExecutor, || {
            control.namespace_executor(&self.ns_dir)
        })?;
        run_step(Step::CheckInitiator, || {
            control.check_for_initiator_existence(ne.as_ref())
        })?;

        // Initiator side
        run_step(Step::LogoutTarget, || {
            control.logout_target(&self.portal, &self.target, ne.as_ref())
        })?;
        info!(device = %self.device, "SCSI device detached");
        self.device.clear();
        metrics::set_attached(&self.target, false);

        run_step(Step::DeleteDiscoveredTarget, || {
            control.delete_discovered_target(&self.portal, &self.target, ne.as_ref())
        })?;

        // Target side
        run_step(Step::UnbindInitiator, || {
            control.unbind_initiator(self.target_id, ALL_INITIATORS)
        })?;
        run_step(Step::DeleteLun, || {
            control.delete_lun(self.target_id, self.lun_id)
        })?;
        run_step(Step::DeleteTarget, || {
            control.delete_target(self.target_id, &self.target)
        })?;
        Ok(())
    }
}
