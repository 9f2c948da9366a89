//! Command execution, optionally inside another process's namespaces.
//!
//! Initiator-side commands have to run in the host's mount and network
//! namespaces (the ones of `/proc/1` as seen from the host), otherwise the
//! sessions they create are invisible to the host kernel. `NamespaceExecutor`
//! wraps such commands with `nsenter`.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, trace};

use super::error::{IscsiError, Result};

const NSENTER: &str = "nsenter";

/// Capability to run an administrative command and collect its stdout.
pub trait CommandExecutor: Debug + Send + Sync {
    fn execute(&self, cmd: &str, args: &[&str]) -> Result<String>;
}

/// Turn a finished command into its stdout, or a `CommandFailed` error
/// carrying stderr verbatim.
pub(crate) fn check_output(command: &str, output: Output) -> Result<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = if stderr.trim().is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.trim().to_string()
    };
    Err(IscsiError::CommandFailed {
        command: command.to_string(),
        stderr,
    })
}

pub(crate) fn describe(cmd: &str, args: &[&str]) -> String {
    std::iter::once(cmd)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands directly, or through `nsenter` bound to a namespace directory.
#[derive(Debug, Clone)]
pub struct NamespaceExecutor {
    ns_dir: Option<PathBuf>,
}

impl NamespaceExecutor {
    /// Bind to a namespace directory such as `/host/proc/1/ns/`.
    ///
    /// An empty path yields a direct executor. Otherwise the directory must
    /// expose both `mnt` and `net` entries.
    pub fn new(ns_dir: impl AsRef<Path>) -> Result<Self> {
        let ns_dir = ns_dir.as_ref();
        if ns_dir.as_os_str().is_empty() {
            return Ok(Self::direct());
        }

        for ns in ["mnt", "net"] {
            if !ns_dir.join(ns).exists() {
                return Err(IscsiError::NamespaceNotFound(
                    ns_dir.join(ns).display().to_string(),
                ));
            }
        }

        debug!(ns_dir = %ns_dir.display(), "Namespace executor bound");
        Ok(Self {
            ns_dir: Some(ns_dir.to_path_buf()),
        })
    }

    /// Executor that runs commands in the caller's own context.
    pub fn direct() -> Self {
        Self { ns_dir: None }
    }

    pub fn ns_dir(&self) -> Option<&Path> {
        self.ns_dir.as_deref()
    }

    /// Program and full argument list that `execute` will spawn.
    fn command_line(&self, cmd: &str, args: &[&str]) -> (String, Vec<String>) {
        match &self.ns_dir {
            None => (
                cmd.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ),
            Some(dir) => {
                let mut full = vec![
                    format!("--mount={}", dir.join("mnt").display()),
                    format!("--net={}", dir.join("net").display()),
                    cmd.to_string(),
                ];
                full.extend(args.iter().map(|a| a.to_string()));
                (NSENTER.to_string(), full)
            }
        }
    }
}

impl CommandExecutor for NamespaceExecutor {
    fn execute(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let (program, full_args) = self.command_line(cmd, args);
        trace!(program = %program, args = ?full_args, "Executing command");

        let output = Command::new(&program).args(&full_args).output()?;
        check_output(&describe(cmd, args), output)
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Records every command line and answers from canned outputs.
    /// Commands without a canned answer succeed with empty stdout; commands
    /// listed in `fail` exit non-zero.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingExecutor {
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) outputs: HashMap<String, String>,
        pub(crate) fail: Vec<String>,
    }

    impl RecordingExecutor {
        pub(crate) fn with_output(mut self, command: &str, stdout: &str) -> Self {
            self.outputs.insert(command.to_string(), stdout.to_string());
            self
        }

        pub(crate) fn failing(mut self, command: &str) -> Self {
            self.fail.push(command.to_string());
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for RecordingExecutor {
        fn execute(&self, cmd: &str, args: &[&str]) -> Result<String> {
            let line = describe(cmd, args);
            self.calls.lock().unwrap().push(line.clone());
            if self.fail.contains(&line) {
                return Err(IscsiError::CommandFailed {
                    command: line,
                    stderr: "mock failure".to_string(),
                });
            }
            Ok(self.outputs.get(&line).cloned().unwrap_or_default())
        }
    }
}
