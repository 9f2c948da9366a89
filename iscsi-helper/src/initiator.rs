//! Initiator-side operations through open-iscsi (`iscsiadm`).
//!
//! Every function takes the executor to run `iscsiadm` with, so callers can
//! direct the commands into the host namespace.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::error::{IscsiError, Result};
use super::executor::CommandExecutor;

const ISCSIADM: &str = "iscsiadm";

/// Polling applied while waiting for the kernel to attach a disk after login.
#[derive(Debug, Clone, Copy)]
pub struct DeviceWait {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// Fail unless `iscsiadm` can be run through `ex`.
pub fn check_for_initiator_existence(ex: &dyn CommandExecutor) -> Result<()> {
    match ex.execute(ISCSIADM, &["--version"]) {
        Ok(version) => {
            debug!(version = %version.trim(), "iSCSI initiator found");
            Ok(())
        }
        Err(e) => Err(IscsiError::InitiatorMissing(e.to_string())),
    }
}

/// Run sendtargets discovery against `portal` and make sure `target` is offered.
#[instrument(skip(ex))]
pub fn discover_target(ex: &dyn CommandExecutor, portal: &str, target: &str) -> Result<()> {
    let output = ex.execute(
        ISCSIADM,
        &["-m", "discovery", "-t", "sendtargets", "-p", portal],
    )?;

    // Lines look like: 10.0.0.1:3260,1 iqn.2014-07.com.rancher:vol
    let found = output
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target));
    if !found {
        warn!(output = %output, "Target missing from discovery output");
        return Err(IscsiError::TargetNotDiscovered {
            portal: portal.to_string(),
            target: target.to_string(),
        });
    }

    info!("iSCSI discovery successful");
    Ok(())
}

/// Remove the node record created by discovery.
#[instrument(skip(ex))]
pub fn delete_discovered_target(
    ex: &dyn CommandExecutor,
    portal: &str,
    target: &str,
) -> Result<()> {
    ex.execute(
        ISCSIADM,
        &["-m", "node", "-o", "delete", "-T", target, "-p", portal],
    )?;
    Ok(())
}

#[instrument(skip(ex))]
pub fn login_target(ex: &dyn CommandExecutor, portal: &str, target: &str) -> Result<()> {
    ex.execute(ISCSIADM, &["-m", "node", "-T", target, "-p", portal, "--login"])?;
    info!("iSCSI login successful");
    Ok(())
}

#[instrument(skip(ex))]
pub fn logout_target(ex: &dyn CommandExecutor, portal: &str, target: &str) -> Result<()> {
    ex.execute(
        ISCSIADM,
        &["-m", "node", "-T", target, "-p", portal, "--logout"],
    )?;
    info!("iSCSI logout successful");
    Ok(())
}

/// Find the local disk attached for `(portal, target, lun)`.
///
/// The disk shows up asynchronously after login, so the session listing is
/// polled up to `wait.attempts` times.
#[instrument(skip(ex, wait))]
pub fn get_device(
    ex: &dyn CommandExecutor,
    portal: &str,
    target: &str,
    lun: u32,
    wait: DeviceWait,
) -> Result<String> {
    for attempt in 1..=wait.attempts {
        let output = ex.execute(ISCSIADM, &["-m", "session", "-P", "3"])?;
        if let Some(device) = parse_session_device(&output, portal, target, lun) {
            info!(device = %device, "iSCSI device attached");
            return Ok(device);
        }
        debug!(attempt, "Attached disk not visible yet");
        if attempt < wait.attempts {
            thread::sleep(wait.interval);
        }
    }

    Err(IscsiError::DeviceNotFound {
        portal: portal.to_string(),
        target: target.to_string(),
        lun,
    })
}

/// Whether a `Current Portal:` value such as `10.0.0.1:3260,1` refers to `portal`,
/// which may be given with or without a port.
fn portal_matches(current: &str, portal: &str) -> bool {
    let addr = current.split(',').next().unwrap_or(current).trim();
    if addr == portal {
        return true;
    }
    match addr.rsplit_once(':') {
        Some((host, _port)) => host.trim_matches(|c| c == '[' || c == ']') == portal,
        None => false,
    }
}

/// Extract the `/dev/...` path of the disk attached for `lun` in the session
/// of `target` at `portal`, from `iscsiadm -m session -P 3` output.
pub fn parse_session_device(output: &str, portal: &str, target: &str, lun: u32) -> Option<String> {
    let mut in_target = false;
    let mut in_portal = false;
    let mut in_lun = false;

    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Target: ") {
            in_target = rest.split_whitespace().next() == Some(target);
            in_portal = false;
            in_lun = false;
        } else if let Some(rest) = line.strip_prefix("Current Portal: ") {
            in_portal = in_target && portal_matches(rest, portal);
            in_lun = false;
        } else if line.starts_with("scsi") && line.contains("Lun: ") {
            let line_lun = line
                .rsplit("Lun: ")
                .next()
                .and_then(|s| s.trim().parse::<u32>().ok());
            in_lun = in_portal && line_lun == Some(lun);
        } else if let Some(rest) = line.strip_prefix("Attached scsi disk ")
            && in_lun
            && let Some(disk) = rest.split_whitespace().next()
        {
            return Some(format!("/dev/{}", disk));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::RecordingExecutor;

    const TARGET: &str = "iqn.2014-07.com.rancher:vol";
    const SESSION_CMD: &str = "iscsiadm -m session -P 3";

    const SESSIONS: &str = "iSCSI Transport Class version 2.0-870
version 2.0-874
Target: iqn.2014-07.com.rancher:other (non-flash)
\tCurrent Portal: 10.0.0.5:3260,1
\tPersistent Portal: 10.0.0.5:3260,1
\t\t************************
\t\tAttached SCSI devices:
\t\t************************
\t\tHost Number: 5\tState: running
\t\tscsi5 Channel 00 Id 0 Lun: 0
\t\tscsi5 Channel 00 Id 0 Lun: 1
\t\t\tAttached scsi disk sda\t\tState: running
Target: iqn.2014-07.com.rancher:vol (non-flash)
\tCurrent Portal: 10.0.0.5:3260,1
\tPersistent Portal: 10.0.0.5:3260,1
\t\t************************
\t\tAttached SCSI devices:
\t\t************************
\t\tHost Number: 6\tState: running
\t\tscsi6 Channel 00 Id 0 Lun: 0
\t\tscsi6 Channel 00 Id 0 Lun: 1
\t\t\tAttached scsi disk sdb\t\tState: running
";

    fn no_wait() -> DeviceWait {
        DeviceWait {
            attempts: 2,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_parse_session_device() {
        assert_eq!(
            parse_session_device(SESSIONS, "10.0.0.5", TARGET, 1),
            Some("/dev/sdb".to_string())
        );
        assert_eq!(
            parse_session_device(SESSIONS, "10.0.0.5:3260", TARGET, 1),
            Some("/dev/sdb".to_string())
        );
        assert_eq!(parse_session_device(SESSIONS, "10.0.0.5", TARGET, 0), None);
        assert_eq!(parse_session_device(SESSIONS, "10.0.0.6", TARGET, 1), None);
        assert_eq!(
            parse_session_device(SESSIONS, "10.0.0.5", "iqn.2014-07.com.rancher:missing", 1),
            None
        );
    }

    #[test]
    fn test_portal_matches() {
        assert!(portal_matches("10.0.0.5:3260,1", "10.0.0.5"));
        assert!(portal_matches("10.0.0.5:3260,1", "10.0.0.5:3260"));
        assert!(portal_matches("[fd00::1]:3260,1", "fd00::1"));
        assert!(!portal_matches("10.0.0.50:3260,1", "10.0.0.5"));
    }

    #[test]
    fn test_check_for_initiator_existence() {
        let ex = RecordingExecutor::default().with_output("iscsiadm --version", "iscsiadm version 2.1.4\n");
        assert!(check_for_initiator_existence(&ex).is_ok());

        let ex = RecordingExecutor::default().failing("iscsiadm --version");
        assert!(matches!(
            check_for_initiator_existence(&ex),
            Err(IscsiError::InitiatorMissing(_))
        ));
    }

    #[test]
    fn test_discover_target() {
        let cmd = "iscsiadm -m discovery -t sendtargets -p 10.0.0.5";
        let ex = RecordingExecutor::default().with_output(cmd, "10.0.0.5:3260,1 iqn.2014-07.com.rancher:vol\n");
        assert!(discover_target(&ex, "10.0.0.5", TARGET).is_ok());

        let ex = RecordingExecutor::default().with_output(cmd, "10.0.0.5:3260,1 iqn.2014-07.com.rancher:other\n");
        assert!(matches!(
            discover_target(&ex, "10.0.0.5", TARGET),
            Err(IscsiError::TargetNotDiscovered { .. })
        ));
    }

    #[test]
    fn test_login_logout_commands() {
        let ex = RecordingExecutor::default();
        login_target(&ex, "10.0.0.5", TARGET).unwrap();
        logout_target(&ex, "10.0.0.5", TARGET).unwrap();
        delete_discovered_target(&ex, "10.0.0.5", TARGET).unwrap();
        assert_eq!(
            ex.calls(),
            vec![
                "iscsiadm -m node -T iqn.2014-07.com.rancher:vol -p 10.0.0.5 --login",
                "iscsiadm -m node -T iqn.2014-07.com.rancher:vol -p 10.0.0.5 --logout",
                "iscsiadm -m node -o delete -T iqn.2014-07.com.rancher:vol -p 10.0.0.5",
            ]
        );
    }

    #[test]
    fn test_get_device() {
        let ex = RecordingExecutor::default().with_output(SESSION_CMD, SESSIONS);
        assert_eq!(
            get_device(&ex, "10.0.0.5", TARGET, 1, no_wait()).unwrap(),
            "/dev/sdb"
        );
        assert_eq!(ex.calls().len(), 1);
    }

    #[test]
    fn test_get_device_gives_up_after_attempts() {
        let ex = RecordingExecutor::default().with_output(SESSION_CMD, "");
        let err = get_device(&ex, "10.0.0.5", TARGET, 1, no_wait()).unwrap_err();
        assert!(matches!(err, IscsiError::DeviceNotFound { lun: 1, .. }));
        assert_eq!(ex.calls().len(), 2);
    }
}
