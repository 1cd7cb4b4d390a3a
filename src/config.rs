//! Driver configuration.
//!
//! `ConfigPaths` replaces process-wide fixed artifact paths: it is built once
//! when an install attempt starts and passed through the whole pipeline, so
//! tests (and alternative live images) can redirect where artifacts land.
//! `DriverConfig` adds the provisioning tool's CLI contract and the reboot
//! command on top of it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;

/// Default artifact prefix; artifact paths are `<prefix><kind suffix>`.
pub const DEFAULT_ARTIFACT_PREFIX: &str = "/tmp/subiquity-config-";
/// File the provisioning tool's progress reporter appends to.
pub const DEFAULT_PROGRESS_PATH: &str = "/tmp/curtin_progress_subiquity";
pub const DEFAULT_PROVISIONER: &str = "/usr/local/curtin/bin/curtin";
pub const DEFAULT_INSTALL_SOURCE: &str = "cp:///media/root-ro";
pub const DEFAULT_REBOOT_COMMAND: &str = "/sbin/reboot";

/// Where generated artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPaths {
    /// Prefix every artifact file name is appended to.
    /// May end in a partial file name (`/tmp/subiquity-config-`).
    pub prefix: String,
    /// Path the progress reporter writes to, embedded in the artifact header.
    pub progress_path: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
            progress_path: PathBuf::from(DEFAULT_PROGRESS_PATH),
        }
    }
}

impl ConfigPaths {
    /// Paths rooted in `dir`, keeping the default file name prefix.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            prefix: format!("{}/subiquity-config-", dir.display()),
            progress_path: dir.join("curtin_progress_subiquity"),
        }
    }

    /// Fixed location for `kind`. Pure: the same kind always maps to the same path.
    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, kind.file_suffix()))
    }
}

/// Settings for one install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub paths: ConfigPaths,
    /// Provisioning tool executable.
    pub provisioner: PathBuf,
    /// Source URI passed after the `install` subcommand.
    pub install_source: String,
    /// Command run by the detached reboot child.
    pub reboot_command: PathBuf,
    /// Reporter name in the artifact header (`reporter: <name>:`).
    pub reporter_name: String,
    /// The installer's own systemd unit, disabled and removed in the target.
    pub installer_service: String,
    /// Installer components whose `/usr/local` trees are removed from the target.
    pub installer_components: Vec<String>,
    /// Write artifacts and log the command, but never launch the tool or reboot.
    pub dry_run: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            provisioner: PathBuf::from(DEFAULT_PROVISIONER),
            install_source: DEFAULT_INSTALL_SOURCE.to_string(),
            reboot_command: PathBuf::from(DEFAULT_REBOOT_COMMAND),
            reporter_name: "subiquity".to_string(),
            installer_service: "subiquity.service".to_string(),
            installer_components: vec![
                "probert".to_string(),
                "curtin".to_string(),
                "subiquity".to_string(),
            ],
            dry_run: false,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a JSON file. Absent fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read driver config from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse driver config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize driver config")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write driver config to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.paths.prefix.trim().is_empty() {
            anyhow::bail!("Artifact prefix must not be empty");
        }
        if self.provisioner.as_os_str().is_empty() {
            anyhow::bail!("Provisioner executable must be specified");
        }
        if self.install_source.trim().is_empty() {
            anyhow::bail!("Install source URI must be specified");
        }
        if !self.install_source.contains("://") {
            anyhow::bail!(
                "Install source '{}' is not a URI (expected scheme://...)",
                self.install_source
            );
        }
        if self.reboot_command.as_os_str().is_empty() {
            anyhow::bail!("Reboot command must be specified");
        }
        // The reporter name becomes a YAML key in the artifact header
        if self.reporter_name.is_empty()
            || !self
                .reporter_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!(
                "Reporter name '{}' may only contain letters, numbers, '-' and '_'",
                self.reporter_name
            );
        }
        for component in &self.installer_components {
            if component.is_empty() || component.contains('/') || component.contains(char::is_whitespace) {
                anyhow::bail!("Invalid installer component name '{}'", component);
            }
        }
        Ok(())
    }
}
