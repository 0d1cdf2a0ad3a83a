use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use log::debug;
use regex::Regex;

use crate::config::VmConfig;
use crate::output::Output;

/// Fallback resolution when the host display size cannot be determined.
pub const DEFAULT_RESOLUTION: &str = "1920x1080";

/// Operation requested against a VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Boot the instance (and set up remote display unless suppressed)
    Start,
    /// Shut the instance down
    Stop,
}

impl Action {
    /// Wire form passed to the manager script.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested start/stop operation. Ephemeral, never persisted.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    /// What to do.
    pub action: Action,
    /// Target VM.
    pub config: VmConfig,
    /// Skip remote-display setup. Only meaningful for `start`.
    pub no_vnc: bool,
    /// Remote display resolution, e.g. `1920x1080`.
    pub resolution: String,
}

/// Resolution of the host display, falling back to [`DEFAULT_RESOLUTION`]
/// when it cannot be determined.
pub fn host_resolution() -> String {
    detect_resolution().unwrap_or_else(|| DEFAULT_RESOLUTION.to_string())
}

fn detect_resolution() -> Option<String> {
    let out = Command::new("xrandr").arg("--current").output().ok()?;
    if !out.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&out.stdout);
    let re = Regex::new(r"current (\d+) x (\d+)").ok()?;
    let caps = re.captures(&text)?;
    Some(format!("{}x{}", &caps[1], &caps[2]))
}

/// Render the manager script invocation for `request`.
///
/// Arguments are positional in a fixed order the script relies on:
/// action, name, zone, project, resolution, then the optional ssh key and
/// username. Absent ssh fields emit no placeholder. `--no-vnc` is only
/// appended for suppressed starts.
fn command_line(script: &Path, request: &OperationRequest) -> String {
    let config = &request.config;

    let mut args = vec![
        request.action.as_str().to_string(),
        config.name.clone(),
        config.zone.clone(),
        config.project_id.clone(),
        request.resolution.clone(),
    ];
    if let Some(key) = &config.ssh_key_path {
        if !key.as_os_str().is_empty() {
            args.push(key.display().to_string());
            // The username fills the positional slot after the key, so it
            // cannot be passed on its own.
            if let Some(user) = &config.ssh_username {
                if !user.is_empty() {
                    args.push(user.clone());
                }
            }
        }
    }

    let mut cmd = format!("{} {}", script.display(), args.iter().join(" "));
    if request.no_vnc && request.action == Action::Start {
        cmd.push_str(" --no-vnc");
    }

    cmd
}

/// Set the executable bits on `script` if they are missing.
///
/// Returns true if a repair was made.
fn ensure_executable(script: &Path) -> Result<bool> {
    let meta = fs::metadata(script)
        .with_context(|| format!("Cannot stat {}", script.display()))?;
    let mut perms = meta.permissions();
    if perms.mode() & 0o111 != 0 {
        return Ok(false);
    }

    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(script, perms)
        .with_context(|| format!("Cannot set executable bits on {}", script.display()))?;

    Ok(true)
}

/// Runs one operation as a child process of the manager script.
///
/// At most one runner is alive at a time; the controller enforces that.
pub struct Runner {
    script: PathBuf,
    request: OperationRequest,
    updates: Sender<Output>,
}

impl Runner {
    /// Construct a runner for `request`. Does not run anything yet.
    pub fn new(script: PathBuf, request: OperationRequest, updates: Sender<Output>) -> Self {
        Self {
            script,
            request,
            updates,
        }
    }

    /// Run the operation to completion.
    ///
    /// Output lines and the terminal exit event are reported through the
    /// `updates` channel passed into the constructor. There is no timeout
    /// and no cancellation; the script runs until it exits.
    pub fn run(self) {
        match ensure_executable(&self.script) {
            Ok(true) => {
                let _ = self.updates.send(Output::Operation(format!(
                    "Fixed executable permissions for {}",
                    self.script.display()
                )));
            }
            Ok(false) => (),
            // Fail open: if the script still cannot run, the shell will
            // surface the real error below.
            Err(e) => {
                let _ = self.updates.send(Output::Operation(format!(
                    "Warning: could not check or fix script permissions: {:#}",
                    e
                )));
            }
        }

        let cmdline = command_line(&self.script, &self.request);
        debug!("manager invocation: bash -lc {:?}", cmdline);

        let mut child = match Command::new("bash")
            .arg("-lc")
            // Merge stderr into stdout so the log is a single ordered stream
            .arg(format!("{} 2>&1", cmdline))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                let _ = self
                    .updates
                    .send(Output::OperationEnd(
                        Err(e).context("Failed to spawn manager script"),
                    ));
                return;
            }
        };

        // unwrap() should never fail b/c we are capturing stdout
        let stdout = child.stdout.take().unwrap();
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    // Remove newline
                    if line.ends_with('\n') {
                        line.pop();
                    }
                    let _ = self.updates.send(Output::Operation(line));
                }
                Err(e) => debug!("Failed to read manager output: {}", e),
            }
        }

        match child.wait() {
            Ok(status) => match status.code() {
                Some(code) => {
                    let _ = self.updates.send(Output::OperationEnd(Ok(code)));
                }
                None => {
                    let _ = self.updates.send(Output::OperationEnd(Err(anyhow!(
                        "Manager script terminated by signal"
                    ))));
                }
            },
            Err(e) => {
                let _ = self.updates.send(Output::OperationEnd(
                    Err(e).context("Failed to wait on manager script"),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;
    use tempfile::tempdir;

    fn vm(key: Option<&str>, user: Option<&str>) -> VmConfig {
        VmConfig {
            name: "web".to_string(),
            zone: "us-central1-a".to_string(),
            project_id: "my-project".to_string(),
            ssh_key_path: key.map(Into::into),
            ssh_username: user.map(str::to_string),
        }
    }

    fn request(action: Action, no_vnc: bool, config: VmConfig) -> OperationRequest {
        OperationRequest {
            action,
            config,
            no_vnc,
            resolution: "1920x1080".to_string(),
        }
    }

    #[rstest]
    // No ssh fields: nothing after the resolution slot
    #[case(
        None,
        None,
        "vm.sh start web us-central1-a my-project 1920x1080"
    )]
    // Key without username
    #[case(
        Some("/keys/id"),
        None,
        "vm.sh start web us-central1-a my-project 1920x1080 /keys/id"
    )]
    // Key and username
    #[case(
        Some("/keys/id"),
        Some("me"),
        "vm.sh start web us-central1-a my-project 1920x1080 /keys/id me"
    )]
    // Username without key cannot fill its positional slot
    #[case(
        None,
        Some("me"),
        "vm.sh start web us-central1-a my-project 1920x1080"
    )]
    // Empty strings are absent, not placeholders
    #[case(
        Some(""),
        Some(""),
        "vm.sh start web us-central1-a my-project 1920x1080"
    )]
    fn test_positional_args(
        #[case] key: Option<&str>,
        #[case] user: Option<&str>,
        #[case] expected: &str,
    ) {
        let req = request(Action::Start, false, vm(key, user));
        assert_eq!(command_line(Path::new("vm.sh"), &req), expected);
    }

    #[test]
    fn test_no_vnc_only_on_start() {
        let start = request(Action::Start, true, vm(None, None));
        assert!(command_line(Path::new("vm.sh"), &start).ends_with(" --no-vnc"));

        let plain_start = request(Action::Start, false, vm(None, None));
        assert!(!command_line(Path::new("vm.sh"), &plain_start).contains("--no-vnc"));

        // The flag is never appended for stop, whatever no_vnc says
        let stop = request(Action::Stop, true, vm(None, None));
        assert!(!command_line(Path::new("vm.sh"), &stop).contains("--no-vnc"));
    }

    #[test]
    fn test_ensure_executable_repairs_missing_bits() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("vm.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&script, perms).unwrap();

        assert!(ensure_executable(&script).unwrap());
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);

        // Already executable: nothing to repair
        assert!(!ensure_executable(&script).unwrap());
    }

    #[test]
    fn test_ensure_executable_missing_script() {
        let dir = tempdir().unwrap();
        ensure_executable(&dir.path().join("nope.sh")).unwrap_err();
    }
}
