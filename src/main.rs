use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use ::gvmctl::{
    host_resolution, spawn_poll_timer, Action, ConfigStore, Controller, Event,
    OperationRequest, Prober, Ui, VmConfig, DEFAULT_POLL_PERIOD,
};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Path to the VM settings file
    #[clap(long, default_value = "vm_settings.json")]
    settings: PathBuf,
    /// Path to the manager script invoked for start/stop
    #[clap(long, default_value = "google_vm_manager.sh")]
    script: PathBuf,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List configured VMs
    List,
    /// Show the current status of a VM
    Status {
        /// Name of the configured VM
        name: String,
    },
    /// Start a VM
    Start {
        /// Name of the configured VM
        name: String,
        /// Skip remote-display (VNC) setup
        #[clap(long)]
        no_vnc: bool,
        /// Remote display resolution, e.g. 2560x1440
        ///
        /// Defaults to the host display resolution, or 1920x1080 if it
        /// cannot be determined.
        #[clap(long)]
        resolution: Option<String>,
    },
    /// Stop a VM
    Stop {
        /// Name of the configured VM
        name: String,
    },
    /// Poll a VM's status periodically
    Watch {
        /// Name of the configured VM
        name: String,
        /// Poll period in seconds
        #[clap(long, default_value_t = DEFAULT_POLL_PERIOD.as_secs())]
        interval: u64,
    },
    /// Add a VM configuration
    Add {
        /// Instance name
        name: String,
        /// Compute zone, e.g. us-central1-a
        zone: String,
        /// Cloud project that owns the instance
        project_id: String,
        /// Path to the SSH key used by the manager script
        #[clap(long)]
        ssh_key: Option<PathBuf>,
        /// Username paired with the SSH key
        #[clap(long, requires = "ssh_key")]
        ssh_username: Option<String>,
    },
    /// Remove a VM configuration
    Remove {
        /// Instance name
        name: String,
    },
}

/// Run one start/stop operation and exit with its code.
fn operate(script: PathBuf, request: OperationRequest) -> Result<()> {
    let controller = Controller::new(script, Prober::default());
    let handle = controller.handle();
    let (presenter, updates) = channel();

    let loop_thread = thread::spawn(move || controller.run(presenter));
    let _ = handle.send(Event::Operate(request));

    let rc = Ui::new().run_operation(updates, handle);
    let _ = loop_thread.join();
    exit(rc);
}

fn status(script: PathBuf, vm: VmConfig) -> Result<()> {
    let controller = Controller::new(script, Prober::default());
    let handle = controller.handle();
    let (presenter, updates) = channel();

    let loop_thread = thread::spawn(move || controller.run(presenter));
    let _ = handle.send(Event::Poll(vm));

    Ui::new().run_status(updates, handle);
    let _ = loop_thread.join();
    Ok(())
}

fn watch(script: PathBuf, vm: VmConfig, period: Duration) -> Result<()> {
    let controller = Controller::new(script, Prober::default());
    let handle = controller.handle();
    let (presenter, updates) = channel();

    thread::spawn(move || controller.run(presenter));

    // A freshly selected VM gets an immediate poll; the timer takes over
    // from there.
    let _ = handle.send(Event::Poll(vm.clone()));
    spawn_poll_timer(handle, vm, period);

    Ui::new().run_watch(updates);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let store = ConfigStore::new(&args.settings);

    match args.command {
        Cmd::List => {
            let configs = store.load();
            if configs.is_empty() {
                println!("No VMs configured. Add one with 'gvmctl add'.");
            }
            for vm in configs {
                println!("{} ({}, {})", vm.name, vm.zone, vm.project_id);
            }
            Ok(())
        }
        Cmd::Status { name } => {
            let vm = store.find(&name)?;
            status(args.script, vm)
        }
        Cmd::Start {
            name,
            no_vnc,
            resolution,
        } => {
            let vm = store.find(&name)?;
            let request = OperationRequest {
                action: Action::Start,
                config: vm,
                no_vnc,
                resolution: resolution.unwrap_or_else(host_resolution),
            };
            operate(args.script, request)
        }
        Cmd::Stop { name } => {
            let vm = store.find(&name)?;
            let request = OperationRequest {
                action: Action::Stop,
                config: vm,
                no_vnc: false,
                resolution: host_resolution(),
            };
            operate(args.script, request)
        }
        Cmd::Watch { name, interval } => {
            let vm = store.find(&name)?;
            watch(args.script, vm, Duration::from_secs(interval))
        }
        Cmd::Add {
            name,
            zone,
            project_id,
            ssh_key,
            ssh_username,
        } => {
            let mut configs = store.load();
            configs.push(VmConfig {
                name,
                zone,
                project_id,
                ssh_key_path: ssh_key,
                ssh_username,
            });
            store.save(&configs).context("Failed to save settings")
        }
        Cmd::Remove { name } => {
            let mut configs = store.load();
            let before = configs.len();
            configs.retain(|vm| vm.name != name);
            if configs.len() == before {
                bail!("No VM named '{}' in {}", name, args.settings.display());
            }
            store.save(&configs).context("Failed to save settings")
        }
    }
}
