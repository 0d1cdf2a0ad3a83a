use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use gvmctl::config::VmConfig;
use gvmctl::controller::{Controller, Event};
use gvmctl::output::Output;
use gvmctl::probe::Prober;

// Settle delay short enough to keep tests snappy but long enough to
// observe that no settle poll was scheduled.
pub const TEST_SETTLE_DELAY: Duration = Duration::from_millis(50);

pub fn vm(name: &str) -> VmConfig {
    VmConfig {
        name: name.to_string(),
        zone: "us-central1-a".to_string(),
        project_id: "my-project".to_string(),
        ssh_key_path: None,
        ssh_username: None,
    }
}

// Write an executable fixture script into `dir`
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write fixture");

    let mut perms = fs::metadata(&path)
        .expect("Failed to stat fixture")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("Failed to chmod fixture");

    path
}

// Fake gcloud that answers describe and list queries with fixed statuses.
// An empty `list` status stands in for "no rows".
pub fn fake_gcloud(dir: &Path, describe: &str, list: &str) -> PathBuf {
    script(
        dir,
        "gcloud",
        &format!(
            r#"case "$*" in
  *" describe "*) echo "{describe}" ;;
  *" list "*) echo "{list}" ;;
  *) exit 1 ;;
esac"#
        ),
    )
}

// Spin up a controller loop on its own thread.
//
// Returns the presentation receiver and the intent handle. The loop exits
// once the test sends `Event::Shutdown` or drops the handle.
pub fn start_controller(script: PathBuf, prober: Prober) -> (Receiver<Output>, Sender<Event>) {
    let controller = Controller::new(script, prober).settle_delay(TEST_SETTLE_DELAY);
    let handle = controller.handle();
    let (presenter, updates) = channel();
    thread::spawn(move || controller.run(presenter));
    (updates, handle)
}
