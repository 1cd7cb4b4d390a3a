//! Validated installer state handed to the driver.
//!
//! A plan is what the interactive installer has collected by the time the
//! user confirms: target disk, created user, network topology and, when the
//! user laid out storage by hand, the structured storage records. Without
//! explicit storage records the single-disk template is used.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::action::{NetworkAction, StorageAction, TargetDisk};
use crate::error::DriverError;
use crate::postinstall::UserProvisioningInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPlan {
    pub target_disk: TargetDisk,
    pub user: UserProvisioningInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkAction>,
    /// Hand-built storage records; `None` selects the single-disk template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Vec<StorageAction>>,
    /// Records of disks to keep, already marked preserve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserved: Vec<StorageAction>,
}

impl InstallPlan {
    /// Load a plan from a JSON file and validate it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read install plan from {:?}", path.as_ref()))?;

        let plan: Self =
            serde_json::from_str(&content).context("Failed to parse install plan JSON")?;

        plan.validate()?;
        Ok(plan)
    }

    /// Check everything that can be checked before an artifact is written.
    pub fn validate(&self) -> std::result::Result<(), DriverError> {
        self.target_disk.base_name()?;
        self.user.validate()?;

        if let Some(storage) = &self.storage {
            if storage.is_empty() {
                return Err(DriverError::validation(
                    "Storage records given but empty; omit them to use the single-disk layout",
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for action in storage {
                if !seen.insert(action.id().to_string()) {
                    return Err(DriverError::validation(format!(
                        "Duplicate storage id '{}'",
                        action.id()
                    )));
                }
            }
        }

        if let Some(action) = self.preserved.iter().find(|a| !a.is_preserved()) {
            return Err(DriverError::validation(format!(
                "Record '{}' is listed as preserved but not marked preserve",
                action.id()
            )));
        }
        Ok(())
    }
}
