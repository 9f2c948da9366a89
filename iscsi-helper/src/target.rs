//! Target-side management through the Linux SCSI target framework.
//!
//! All operations drive `tgtadm` against a running `tgtd`. Targets, LUNs and
//! ACLs are identified by the numeric target id (tid); the IQN is only needed
//! when creating a target.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::error::{IscsiError, Result};
use super::executor::CommandExecutor;

const TGTADM: &str = "tgtadm";
const TGTD: &str = "tgtd";

/// Settings for launching `tgtd` when it is not already running.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// File that receives the daemon's stdout/stderr
    pub log_path: PathBuf,
    /// How many times to probe for readiness after spawning
    pub ready_attempts: u32,
    /// Delay between readiness probes
    pub ready_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/tgtd.log"),
            ready_attempts: 10,
            ready_interval: Duration::from_secs(1),
        }
    }
}

/// Validate that a target name is safe to pass to `tgtadm`/`iscsiadm`.
/// Allows alphanumeric, underscore, hyphen, period and colon (IQN format).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IscsiError::InvalidName("name cannot be empty".into()));
    }

    if name.len() > 223 {
        return Err(IscsiError::InvalidName(format!(
            "name '{}' exceeds maximum length of 223 characters",
            name
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':')
    {
        return Err(IscsiError::InvalidName(format!(
            "invalid characters in name '{}': only alphanumeric, underscore, hyphen, period, and colon allowed",
            name
        )));
    }

    Ok(())
}

fn tgtadm(ex: &dyn CommandExecutor, args: &[&str]) -> Result<String> {
    let mut full = vec!["--lld", "iscsi"];
    full.extend_from_slice(args);
    ex.execute(TGTADM, &full)
}

/// Whether `tgtd` answers management requests.
pub fn is_daemon_running(ex: &dyn CommandExecutor) -> bool {
    tgtadm(ex, &["--op", "show", "--mode", "system"]).is_ok()
}

/// Ensure `tgtd` is running.
///
/// Without `force`, an already running daemon is left alone. Otherwise a new
/// `tgtd -f` is spawned in the background and probed until it answers.
#[instrument(skip(ex, config))]
pub fn start_daemon(ex: &dyn CommandExecutor, force: bool, config: &DaemonConfig) -> Result<()> {
    if !force && is_daemon_running(ex) {
        debug!("tgtd already running");
        return Ok(());
    }

    info!(log = %config.log_path.display(), "Starting tgtd");
    let log = open_log(&config.log_path)?;
    let child = Command::new(TGTD)
        .arg("-f")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;
    reap_in_background(child)?;

    for attempt in 1..=config.ready_attempts {
        if is_daemon_running(ex) {
            info!(attempt, "tgtd is ready");
            return Ok(());
        }
        thread::sleep(config.ready_interval);
    }

    warn!(attempts = config.ready_attempts, "tgtd did not become ready");
    Err(IscsiError::DaemonNotReady(config.ready_attempts))
}

/// Wait for `child` on a detached thread so it is reaped whenever it exits.
fn reap_in_background(mut child: Child) -> Result<JoinHandle<()>> {
    let pid = child.id();
    let handle = thread::Builder::new()
        .name("tgtd-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) => warn!(pid, %status, "tgtd exited"),
            Err(e) => warn!(pid, error = %e, "Failed to wait for tgtd"),
        })?;
    Ok(handle)
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[instrument(skip(ex))]
pub fn create_target(ex: &dyn CommandExecutor, tid: u32, name: &str) -> Result<()> {
    validate_name(name)?;
    let tid = tid.to_string();
    tgtadm(
        ex,
        &["--op", "new", "--mode", "target", "--tid", &tid, "-T", name],
    )?;
    info!("Created target");
    Ok(())
}

/// Delete a target. `tgtadm` addresses it by tid alone; the name is for logs.
#[instrument(skip(ex))]
pub fn delete_target(ex: &dyn CommandExecutor, tid: u32, name: &str) -> Result<()> {
    let tid = tid.to_string();
    tgtadm(ex, &["--op", "delete", "--mode", "target", "--tid", &tid])?;
    info!("Deleted target");
    Ok(())
}

/// Attach a backing store as a LUN. Empty `bs_type`/`bs_opts` fall back to
/// the daemon defaults.
#[instrument(skip(ex))]
pub fn add_lun(
    ex: &dyn CommandExecutor,
    tid: u32,
    lun: u32,
    backing_file: &str,
    bs_type: &str,
    bs_opts: &str,
) -> Result<()> {
    let tid = tid.to_string();
    let lun = lun.to_string();
    let mut args: Vec<&str> = vec![
        "--op",
        "new",
        "--mode",
        "logicalunit",
        "--tid",
        &tid,
        "--lun",
        &lun,
        "-b",
        backing_file,
    ];
    if !bs_type.is_empty() {
        args.extend_from_slice(&["--bstype", bs_type]);
    }
    if !bs_opts.is_empty() {
        args.extend_from_slice(&["--bsopts", bs_opts]);
    }
    tgtadm(ex, &args)?;
    info!("Added LUN");
    Ok(())
}

#[instrument(skip(ex))]
pub fn delete_lun(ex: &dyn CommandExecutor, tid: u32, lun: u32) -> Result<()> {
    let tid = tid.to_string();
    let lun = lun.to_string();
    tgtadm(
        ex,
        &[
            "--op",
            "delete",
            "--mode",
            "logicalunit",
            "--tid",
            &tid,
            "--lun",
            &lun,
        ],
    )?;
    info!("Deleted LUN");
    Ok(())
}

/// Allow an initiator address (or `ALL`) to access the target.
#[instrument(skip(ex))]
pub fn bind_initiator(ex: &dyn CommandExecutor, tid: u32, initiator: &str) -> Result<()> {
    let tid = tid.to_string();
    tgtadm(
        ex,
        &["--op", "bind", "--mode", "target", "--tid", &tid, "-I", initiator],
    )?;
    Ok(())
}

#[instrument(skip(ex))]
pub fn unbind_initiator(ex: &dyn CommandExecutor, tid: u32, initiator: &str) -> Result<()> {
    let tid = tid.to_string();
    tgtadm(
        ex,
        &["--op", "unbind", "--mode", "target", "--tid", &tid, "-I", initiator],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::RecordingExecutor;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("iqn.2014-07.com.rancher:vol-1").is_ok());
        assert!(validate_name("vol_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("vol 1").is_err());
        assert!(validate_name("vol;rm -rf /").is_err());
        assert!(validate_name(&"a".repeat(224)).is_err());
    }

    #[test]
    fn test_create_target_command() {
        let ex = RecordingExecutor::default();
        create_target(&ex, 1, "iqn.2014-07.com.rancher:vol").unwrap();
        assert_eq!(
            ex.calls(),
            vec![
                "tgtadm --lld iscsi --op new --mode target --tid 1 -T iqn.2014-07.com.rancher:vol"
            ]
        );
    }

    #[test]
    fn test_create_target_rejects_bad_name() {
        let ex = RecordingExecutor::default();
        assert!(matches!(
            create_target(&ex, 1, "bad name"),
            Err(IscsiError::InvalidName(_))
        ));
        assert!(ex.calls().is_empty());
    }

    #[test]
    fn test_add_lun_optional_backing_store_args() {
        let ex = RecordingExecutor::default();
        add_lun(&ex, 1, 1, "/var/lib/vol.img", "", "").unwrap();
        add_lun(&ex, 1, 2, "/var/lib/vol.img", "aio", "direct").unwrap();
        assert_eq!(
            ex.calls(),
            vec![
                "tgtadm --lld iscsi --op new --mode logicalunit --tid 1 --lun 1 -b /var/lib/vol.img",
                "tgtadm --lld iscsi --op new --mode logicalunit --tid 1 --lun 2 -b /var/lib/vol.img --bstype aio --bsopts direct",
            ]
        );
    }

    #[test]
    fn test_teardown_commands() {
        let ex = RecordingExecutor::default();
        unbind_initiator(&ex, 1, "ALL").unwrap();
        delete_lun(&ex, 1, 1).unwrap();
        delete_target(&ex, 1, "iqn.2014-07.com.rancher:vol").unwrap();
        assert_eq!(
            ex.calls(),
            vec![
                "tgtadm --lld iscsi --op unbind --mode target --tid 1 -I ALL",
                "tgtadm --lld iscsi --op delete --mode logicalunit --tid 1 --lun 1",
                "tgtadm --lld iscsi --op delete --mode target --tid 1",
            ]
        );
    }

    #[test]
    fn test_start_daemon_skips_running_daemon() {
        let ex = RecordingExecutor::default();
        start_daemon(&ex, false, &DaemonConfig::default()).unwrap();
        assert_eq!(
            ex.calls(),
            vec!["tgtadm --lld iscsi --op show --mode system"]
        );
    }

    #[test]
    fn test_exited_child_is_reaped() {
        let child = Command::new("true").spawn().unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", child.id()));

        reap_in_background(child).unwrap().join().unwrap();

        // A zombie keeps its /proc entry until waited on
        assert!(!proc_dir.exists());
    }

    #[test]
    fn test_command_failure_is_passed_through() {
        let ex = RecordingExecutor::default()
            .failing("tgtadm --lld iscsi --op bind --mode target --tid 1 -I ALL");
        match bind_initiator(&ex, 1, "ALL").unwrap_err() {
            IscsiError::CommandFailed { stderr, .. } => assert_eq!(stderr, "mock failure"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
