use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Configuration for a single managed VM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Instance name as known to the cloud provider.
    ///
    /// Uniqueness within the settings file is enforced on save.
    pub name: String,
    /// Compute zone the instance lives in, e.g. `us-central1-a`.
    pub zone: String,
    /// Cloud project that owns the instance.
    pub project_id: String,
    /// Path to the SSH key the manager script should use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    /// Username paired with the SSH key.
    ///
    /// Only meaningful together with `ssh_key_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
}

/// Loads and saves the list of VM configurations.
///
/// The backing file is a JSON document containing a top-level list. The
/// path is injected at construction, never taken from ambient process
/// state.
pub struct ConfigStore {
    path: PathBuf,
}

/// Validate the statically known config parameters
fn validate_configs(configs: &[VmConfig]) -> Result<()> {
    let mut seen = HashSet::new();

    for (idx, vm) in configs.iter().enumerate() {
        if vm.name.is_empty() {
            bail!("VM index={} name empty", idx);
        }
        if vm.zone.is_empty() {
            bail!("VM '{}' has empty zone", vm.name);
        }
        if vm.project_id.is_empty() {
            bail!("VM '{}' has empty project_id", vm.name);
        }
        if !seen.insert(vm.name.as_str()) {
            bail!("VM name '{}' is not unique", vm.name);
        }
    }

    Ok(())
}

impl ConfigStore {
    /// Construct a store backed by `path`.
    pub fn new<T: AsRef<Path>>(path: T) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    /// Load the configured VMs.
    ///
    /// An absent or malformed settings file is an empty list, never an
    /// error.
    pub fn load(&self) -> Vec<VmConfig> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("No settings file at {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Malformed settings file {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Validate and save `configs`, fully rewriting the settings file.
    ///
    /// The rewrite goes through a tempfile in the target directory so the
    /// settings file is never observable half-written.
    pub fn save(&self, configs: &[VmConfig]) -> Result<()> {
        validate_configs(configs).context("Invalid VM configuration")?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp =
            NamedTempFile::new_in(dir).context("Failed to create settings tempfile")?;
        serde_json::to_writer_pretty(&mut tmp, configs)
            .context("Failed to serialize settings")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        Ok(())
    }

    /// Find the first configured VM named `name`.
    pub fn find(&self, name: &str) -> Result<VmConfig> {
        self.load()
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| anyhow!("No VM named '{}' in {}", name, self.path.display()))
    }
}
