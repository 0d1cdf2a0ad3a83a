use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use console::Color;
use itertools::Itertools;
use log::{debug, log_enabled, warn, Level};

use crate::config::VmConfig;

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Classified state of a VM as reported by the cloud CLI.
///
/// `Unknown` covers queries that ran but returned non-zero or text outside
/// the known set; `Error` covers queries that timed out or failed to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmStatus {
    /// Instance is up
    Running,
    /// Instance is shut down
    Stopped,
    /// Shutdown in progress
    Stopping,
    /// Boot in progress
    Starting,
    /// Resources are being allocated
    Provisioning,
    /// Provider is repairing the instance
    Repairing,
    /// Instance is terminated (or, for preemptibles, merely stopped)
    Terminated,
    /// Query succeeded but the state could not be classified
    Unknown,
    /// Query failed or timed out
    Error,
}

impl VmStatus {
    fn parse(label: &str) -> VmStatus {
        match label {
            "RUNNING" => VmStatus::Running,
            "STOPPED" => VmStatus::Stopped,
            "STOPPING" => VmStatus::Stopping,
            "STARTING" => VmStatus::Starting,
            "PROVISIONING" => VmStatus::Provisioning,
            "REPAIRING" => VmStatus::Repairing,
            "TERMINATED" => VmStatus::Terminated,
            _ => VmStatus::Unknown,
        }
    }

    /// Uppercase display label, matching the provider's spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "RUNNING",
            VmStatus::Stopped => "STOPPED",
            VmStatus::Stopping => "STOPPING",
            VmStatus::Starting => "STARTING",
            VmStatus::Provisioning => "PROVISIONING",
            VmStatus::Repairing => "REPAIRING",
            VmStatus::Terminated => "TERMINATED",
            VmStatus::Unknown => "UNKNOWN",
            VmStatus::Error => "ERROR",
        }
    }

    /// Display color for this status.
    ///
    /// Statuses without an entry in the table get a neutral default.
    pub fn color(&self) -> Color {
        match self {
            VmStatus::Running => Color::Green,
            VmStatus::Stopped | VmStatus::Terminated | VmStatus::Error => Color::Red,
            VmStatus::Stopping | VmStatus::Starting => Color::Yellow,
            VmStatus::Provisioning => Color::Cyan,
            VmStatus::Repairing => Color::Magenta,
            _ => Color::White,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First whitespace-trimmed field of the query output, if any.
fn first_field(out: &str) -> Option<&str> {
    let field = out.lines().next()?.trim();
    if field.is_empty() {
        None
    } else {
        Some(field)
    }
}

/// Resolve the display status from the primary describe result and the
/// secondary list result.
///
/// Only meaningful when the primary result is `Terminated`: a listed
/// instance in `TERMINATED` or `STOPPING` is displayed as `STOPPED`, any
/// other listed status wins verbatim, and an absent row falls back to the
/// raw primary result.
fn resolve_status(primary: VmStatus, listed: Option<VmStatus>) -> VmStatus {
    match listed {
        Some(VmStatus::Terminated) | Some(VmStatus::Stopping) => VmStatus::Stopped,
        Some(other) => other,
        None => primary,
    }
}

/// Run `cmd` to completion with a deadline.
///
/// Returns the exit code and captured stdout. The child is killed and
/// reaped if the deadline passes.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<(i32, String)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    if log_enabled!(Level::Debug) {
        let args = cmd.get_args().map(|a| a.to_string_lossy()).join(" ");
        debug!(
            "query invocation: {} {}",
            cmd.get_program().to_string_lossy(),
            args
        );
    }

    let child = cmd.spawn().context("Failed to spawn status query")?;
    let mut child = scopeguard::guard(child, |mut c: Child| {
        // Reap the child if it is still alive when we bail
        if let Ok(None) = c.try_wait() {
            let _ = c.kill();
            let _ = c.wait();
        }
    });

    let now = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to wait on status query")? {
            break status;
        }
        if now.elapsed() >= timeout {
            bail!("Status query timed out after {:?}", timeout);
        }
        thread::sleep(Duration::from_millis(50));
    };

    // unwrap() should never fail b/c we are capturing stdout
    let mut stdout = child.stdout.take().unwrap();
    let mut out = String::new();
    stdout
        .read_to_string(&mut out)
        .context("Failed to read status query output")?;

    match status.code() {
        Some(code) => Ok((code, out)),
        None => bail!("Status query terminated by signal"),
    }
}

/// Answers "what state is this VM in right now" with short-lived,
/// read-only CLI queries.
#[derive(Clone)]
pub struct Prober {
    gcloud: PathBuf,
    describe_timeout: Duration,
    list_timeout: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new("gcloud".into())
    }
}

impl Prober {
    /// Construct a prober that invokes `gcloud` for its queries.
    pub fn new(gcloud: PathBuf) -> Self {
        Self {
            gcloud,
            describe_timeout: DESCRIBE_TIMEOUT,
            list_timeout: LIST_TIMEOUT,
        }
    }

    /// Override the query timeouts. Mostly useful for tests.
    pub fn timeouts(mut self, describe: Duration, list: Duration) -> Self {
        self.describe_timeout = describe;
        self.list_timeout = list;
        self
    }

    fn describe(&self, vm: &VmConfig) -> Result<(i32, String)> {
        let mut cmd = Command::new(&self.gcloud);
        cmd.args(["compute", "instances", "describe"])
            .arg(&vm.name)
            .arg("--zone")
            .arg(&vm.zone)
            .arg("--project")
            .arg(&vm.project_id)
            .args(["--format", "value(status)"]);
        run_with_timeout(cmd, self.describe_timeout)
    }

    fn list(&self, vm: &VmConfig) -> Result<(i32, String)> {
        let mut cmd = Command::new(&self.gcloud);
        cmd.args(["compute", "instances", "list"])
            .arg("--project")
            .arg(&vm.project_id)
            .arg("--filter")
            .arg(format!("name={} AND zone:{}", vm.name, vm.zone))
            .args(["--format", "value(status)"]);
        run_with_timeout(cmd, self.list_timeout)
    }

    /// Classify the current state of `vm`.
    ///
    /// Never fails: timeouts and spawn errors collapse to `Error`, a
    /// non-zero describe exit collapses to `Unknown`. Failures here are
    /// retried naturally on the next poll cycle.
    pub fn probe(&self, vm: &VmConfig) -> VmStatus {
        let primary = match self.describe(vm) {
            Ok((0, out)) => match first_field(&out) {
                Some(field) => VmStatus::parse(field),
                None => VmStatus::Unknown,
            },
            Ok((code, _)) => {
                debug!("describe query for '{}' exited with {}", vm.name, code);
                VmStatus::Unknown
            }
            Err(e) => {
                warn!("describe query for '{}' failed: {:#}", vm.name, e);
                VmStatus::Error
            }
        };

        if primary != VmStatus::Terminated {
            return primary;
        }

        // Preemptible instances report TERMINATED from describe while they
        // are merely stopped. The list query tells the two apart.
        let listed = match self.list(vm) {
            Ok((0, out)) => first_field(&out).map(VmStatus::parse),
            Ok((code, _)) => {
                debug!("list query for '{}' exited with {}", vm.name, code);
                None
            }
            Err(e) => {
                warn!("list query for '{}' failed: {:#}", vm.name, e);
                None
            }
        };

        resolve_status(primary, listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case("RUNNING", VmStatus::Running)]
    #[case("TERMINATED", VmStatus::Terminated)]
    #[case("PROVISIONING", VmStatus::Provisioning)]
    #[case("SUSPENDED", VmStatus::Unknown)]
    #[case("running", VmStatus::Unknown)]
    fn test_parse(#[case] label: &str, #[case] expected: VmStatus) {
        assert_eq!(VmStatus::parse(label), expected);
    }

    #[rstest]
    // Preemptible stopped instances still show up in the list
    #[case(Some(VmStatus::Stopping), VmStatus::Stopped)]
    #[case(Some(VmStatus::Terminated), VmStatus::Stopped)]
    // Any other listed status wins verbatim
    #[case(Some(VmStatus::Running), VmStatus::Running)]
    // Instance absent from the list: keep the raw primary result
    #[case(None, VmStatus::Terminated)]
    fn test_resolve_terminated(
        #[case] listed: Option<VmStatus>,
        #[case] expected: VmStatus,
    ) {
        assert_eq!(resolve_status(VmStatus::Terminated, listed), expected);
    }

    #[test]
    fn test_first_field() {
        assert_eq!(first_field("RUNNING\n"), Some("RUNNING"));
        assert_eq!(first_field("  RUNNING  \nSTOPPED\n"), Some("RUNNING"));
        assert_eq!(first_field(""), None);
        assert_eq!(first_field("\n"), None);
    }

    #[test]
    fn test_unlisted_status_color_is_neutral() {
        assert_eq!(VmStatus::Unknown.color(), Color::White);
    }

    #[test]
    fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo RUNNING"]);
        let (code, out) = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "RUNNING\n");
    }

    #[test]
    fn test_run_with_timeout_kills_slow_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        run_with_timeout(cmd, Duration::from_millis(200)).unwrap_err();
    }

    #[test]
    fn test_run_with_timeout_reports_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        let (code, _) = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 7);
    }
}
