//! Single-disk storage template.
//!
//! Renders the whole storage artifact for the simple "use this one disk"
//! install from a fixed template with Tera. Tera fails on undefined
//! variables, so a disk without a model or serial never produces a file with
//! an empty identifier; the error is raised before the artifact is touched.
//!
//! Ids in the template are bound from [`ActionId`] values derived from one
//! [`DiskBaseName`], never assembled inside the template. The written file is
//! parsed back and must equal [`single_disk_layout`] for the same disk.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tera::{Context, Tera};
use tracing::{debug, info};

use crate::action::{layout, single_disk_layout, ActionId, StorageAction, TargetDisk};
use crate::artifact::{self, ArtifactKind, ArtifactWriter};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};

const TEMPLATE_NAME: &str = "storage.yaml";

/// Full storage artifact for one disk: boot+root partition and home partition,
/// both ext4.
pub const STORAGE_TEMPLATE: &str = r#"# Autogenerated by {{ reporter_name }}: {{ generated_at }} UTC
reporter:
 {{ reporter_name }}:
  path: {{ progress_path }}
  progress: True

partitioning_commands:
 builtin: curtin block-meta custom

storage:
  version: 1
  config:
    - id: {{ disk_id }}
      type: disk
      ptable: msdos
      model: {{ disk_model }}
      serial: {{ disk_serial }}
    - id: {{ root_partition_id }}
      type: partition
      offset: {{ root_offset }}
      size: {{ root_size }}
      device: {{ disk_id }}
      flag: boot
    - id: {{ home_partition_id }}
      type: partition
      offset: {{ home_offset }}
      size: {{ home_size }}
      device: {{ disk_id }}
    - id: {{ root_format_id }}
      type: format
      fstype: {{ fstype }}
      volume: {{ root_partition_id }}
    - id: {{ home_format_id }}
      type: format
      fstype: {{ fstype }}
      volume: {{ home_partition_id }}
    - id: {{ root_mount_id }}
      type: mount
      path: /
      device: {{ root_format_id }}
    - id: {{ home_mount_id }}
      type: mount
      path: /home
      device: {{ home_format_id }}
"#;

pub struct TemplateRenderer {
    tera: Tera,
    writer: ArtifactWriter,
}

impl TemplateRenderer {
    pub fn new(config: &DriverConfig) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, STORAGE_TEMPLATE)
            .map_err(|e| DriverError::template(&e))?;
        debug!("[TemplateRenderer] Loaded template: {}", TEMPLATE_NAME);

        Ok(Self {
            tera,
            writer: ArtifactWriter::new(config),
        })
    }

    /// Bind every placeholder that `disk` can supply.
    ///
    /// Every value is bound as a double-quoted scalar so ids like `true` or
    /// `0` stay strings. Absent model or serial stay unbound so rendering
    /// fails.
    fn context(&self, disk: &TargetDisk, generated_at: DateTime<Utc>) -> Result<Context> {
        use layout::*;

        let base = disk.base_name()?;
        let mut ctx = Context::new();
        let mut bind = |key: &str, value: &str| -> Result<()> {
            ctx.insert(key, &artifact::quoted_scalar(value)?);
            Ok(())
        };

        bind(
            "progress_path",
            &self.writer.paths().progress_path.to_string_lossy(),
        )?;

        bind("disk_id", &ActionId::disk(&base).to_string())?;
        if let Some(model) = &disk.model {
            bind("disk_model", model)?;
        }
        if let Some(serial) = &disk.serial {
            bind("disk_serial", serial)?;
        }

        bind(
            "root_partition_id",
            &ActionId::partition(&base, ROOT_PARTITION).to_string(),
        )?;
        bind(
            "home_partition_id",
            &ActionId::partition(&base, HOME_PARTITION).to_string(),
        )?;
        bind(
            "root_format_id",
            &ActionId::format(&base, ROOT_PARTITION, "root").to_string(),
        )?;
        bind(
            "home_format_id",
            &ActionId::format(&base, HOME_PARTITION, "home").to_string(),
        )?;
        bind("root_mount_id", &ActionId::mount(&base, ROOT_PARTITION).to_string())?;
        bind("home_mount_id", &ActionId::mount(&base, HOME_PARTITION).to_string())?;

        bind("root_offset", ROOT_OFFSET)?;
        bind("root_size", ROOT_SIZE)?;
        bind("home_offset", HOME_OFFSET)?;
        bind("home_size", HOME_SIZE)?;
        bind("fstype", FSTYPE)?;

        // Key and comment text; config validation limits it to [A-Za-z0-9_-]
        ctx.insert("reporter_name", self.writer.reporter_name());
        ctx.insert(
            "generated_at",
            &generated_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        );
        Ok(ctx)
    }

    /// Render the storage artifact for `disk` without writing it.
    ///
    /// # Errors
    ///
    /// `Template` if a placeholder is unbound (missing model or serial),
    /// `Validation` if the disk name has no device leaf.
    pub fn render(&self, disk: &TargetDisk, generated_at: DateTime<Utc>) -> Result<String> {
        let ctx = self.context(disk, generated_at)?;
        self.tera
            .render(TEMPLATE_NAME, &ctx)
            .map_err(|e| DriverError::template(&e))
    }

    /// Render and write the storage artifact for `disk`, returning its path.
    ///
    /// This replaces the structured storage artifact; a run uses one or the
    /// other, never both.
    pub fn render_disk_template(&self, disk: &TargetDisk) -> Result<PathBuf> {
        let content = self.render(disk, Utc::now())?;
        verify_rendered(&content, disk)?;
        let path = self.writer.paths().artifact_path(ArtifactKind::Storage);
        artifact::write_replacing(&path, &content)?;
        info!(
            "Wrote single-disk storage template for {} to {}",
            disk.name,
            path.display()
        );
        Ok(path)
    }
}

/// Parse a rendered document back and check it against the structured layout
/// for the same disk.
///
/// # Errors
///
/// `Template` if the document is not valid storage YAML, `Validation` if it
/// parses to different records.
pub fn verify_rendered(rendered: &str, disk: &TargetDisk) -> Result<()> {
    let doc: serde_yaml::Value = serde_yaml::from_str(rendered)
        .map_err(|e| DriverError::Template(format!("rendered storage is not valid YAML: {}", e)))?;
    let config = doc
        .get("storage")
        .and_then(|storage| storage.get("config"))
        .cloned()
        .ok_or_else(|| DriverError::Template("rendered storage has no storage.config".into()))?;
    let actions: Vec<StorageAction> = serde_yaml::from_value(config).map_err(|e| {
        DriverError::Template(format!("rendered storage records do not parse: {}", e))
    })?;

    if actions != single_disk_layout(disk)? {
        return Err(DriverError::validation(format!(
            "rendered storage for {} differs from its structured layout",
            disk.name
        )));
    }
    Ok(())
}
