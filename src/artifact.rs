//! Configuration artifacts consumed by curtin.
//!
//! Every artifact is written to a fixed path derived from its kind, fully
//! replacing whatever was there. Network and storage artifacts share a
//! header (progress reporter + partitioning command) and embed their body
//! under a fixed parent key, so the serialized body is re-indented by
//! [`BODY_INDENT`] to sit exactly under `config:`.
//!
//! ```text
//! # Autogenerated by subiquity: 2026-10-19 08:00:00.000000 UTC
//! reporter:
//!  subiquity:
//!   path: /tmp/curtin_progress_subiquity
//!   progress: True
//!
//! partitioning_commands:
//!  builtin: curtin block-meta custom
//!
//! storage:
//!   version: 1
//!   config:
//!     - type: disk
//!       id: sda
//! ```

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, info};

use crate::action::{NetworkAction, StorageAction};
use crate::config::{ConfigPaths, DriverConfig};
use crate::error::{DriverError, Result};
use crate::postinstall::{self, LateCommands, UserProvisioningInfo};

/// Indentation of the body under its parent key.
pub const BODY_INDENT: &str = "    ";

/// Kind of generated artifact. Each kind has exactly one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Network,
    Storage,
    Preserved,
    Postinstall,
}

impl ArtifactKind {
    /// File name appended to the artifact prefix
    pub const fn file_suffix(self) -> &'static str {
        match self {
            Self::Network => "network.yaml",
            Self::Storage => "storage.yaml",
            Self::Preserved => "storage-preserved.yaml",
            Self::Postinstall => "postinst.yaml",
        }
    }

    /// Top-level key the body is embedded under
    pub const fn section_key(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage | Self::Preserved => "storage",
            Self::Postinstall => "late_commands",
        }
    }

    /// Whether the reporter/partitioning header precedes the body
    pub const fn has_header(self) -> bool {
        !matches!(self, Self::Postinstall)
    }
}

/// Structured content of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactBody {
    Storage(Vec<StorageAction>),
    Network(Vec<NetworkAction>),
    LateCommands(LateCommands),
}

impl ArtifactBody {
    fn name(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Network(_) => "network",
            Self::LateCommands(_) => "late-commands",
        }
    }

    fn accepts(&self, kind: ArtifactKind) -> bool {
        matches!(
            (self, kind),
            (Self::Storage(_), ArtifactKind::Storage | ArtifactKind::Preserved)
                | (Self::Network(_), ArtifactKind::Network)
                | (Self::LateCommands(_), ArtifactKind::Postinstall)
        )
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Storage(actions) => actions.is_empty(),
            Self::Network(actions) => actions.is_empty(),
            Self::LateCommands(commands) => commands.is_empty(),
        }
    }

    fn to_yaml(&self) -> Result<String> {
        let yaml = match self {
            Self::Storage(actions) => serde_yaml::to_string(actions)?,
            Self::Network(actions) => serde_yaml::to_string(actions)?,
            Self::LateCommands(commands) => serde_yaml::to_string(commands)?,
        };
        Ok(yaml)
    }
}

/// Prefix every non-empty line with [`BODY_INDENT`].
pub fn indent_body(yaml: &str) -> String {
    let mut out = String::with_capacity(yaml.len() + yaml.lines().count() * BODY_INDENT.len());
    for line in yaml.lines() {
        if !line.is_empty() {
            out.push_str(BODY_INDENT);
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Render `value` as a double-quoted scalar that is safe inline at any nesting.
///
/// JSON string syntax is valid YAML double-quoted syntax, and it never
/// spans lines.
pub(crate) fn quoted_scalar(value: &str) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// The `# Autogenerated` comment line. Informational only; curtin ignores it.
pub fn generation_comment(reporter_name: &str, generated_at: DateTime<Utc>) -> String {
    format!(
        "# Autogenerated by {}: {} UTC\n",
        reporter_name,
        generated_at.format("%Y-%m-%d %H:%M:%S%.6f")
    )
}

/// Writes artifacts under the paths of one install attempt.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    paths: ConfigPaths,
    reporter_name: String,
}

impl ArtifactWriter {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            paths: config.paths.clone(),
            reporter_name: config.reporter_name.clone(),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn reporter_name(&self) -> &str {
        &self.reporter_name
    }

    /// Shared reporter + partitioning-command header.
    pub fn header(&self) -> Result<String> {
        Ok(format!(
            "reporter:\n {name}:\n  path: {path}\n  progress: True\n\n\
             partitioning_commands:\n builtin: curtin block-meta custom\n\n",
            name = self.reporter_name,
            path = quoted_scalar(&self.paths.progress_path.to_string_lossy())?,
        ))
    }

    /// Render an artifact without touching the filesystem.
    ///
    /// Output depends only on the inputs; two renders with the same body and
    /// timestamp are byte-identical.
    pub fn render(
        &self,
        kind: ArtifactKind,
        body: &ArtifactBody,
        generated_at: DateTime<Utc>,
    ) -> Result<String> {
        if !body.accepts(kind) {
            return Err(DriverError::validation(format!(
                "{} artifact cannot hold a {} body",
                kind,
                body.name()
            )));
        }
        if kind == ArtifactKind::Preserved {
            if let ArtifactBody::Storage(actions) = body {
                if let Some(action) = actions.iter().find(|a| !a.is_preserved()) {
                    return Err(DriverError::validation(format!(
                        "preserved storage record '{}' is not marked preserve",
                        action.id()
                    )));
                }
            }
        }
        // An empty list would serialize as flow-style `[]`
        if body.is_empty() {
            return Err(DriverError::validation(format!(
                "{} artifact has no records",
                kind
            )));
        }

        let mut out = generation_comment(&self.reporter_name, generated_at);
        if kind.has_header() {
            out.push_str(&self.header()?);
            out.push_str(kind.section_key());
            out.push_str(":\n  version: 1\n  config:\n");
        } else {
            out.push_str(kind.section_key());
            out.push_str(":\n");
        }
        out.push_str(&indent_body(&body.to_yaml()?));
        Ok(out)
    }

    /// Render and write one artifact, returning its path.
    ///
    /// # Errors
    ///
    /// - `Validation` if the body is empty or does not fit the kind, or a
    ///   preserved storage record is not marked preserve. Nothing is written.
    /// - `FileIo` if the path cannot be written.
    pub fn write_artifact(&self, kind: ArtifactKind, body: &ArtifactBody) -> Result<PathBuf> {
        let content = self.render(kind, body, Utc::now())?;
        let path = self.paths.artifact_path(kind);
        write_replacing(&path, &content)?;
        info!("Wrote {} artifact to {}", kind, path.display());
        Ok(path)
    }

    pub fn write_storage_actions(&self, actions: &[StorageAction]) -> Result<PathBuf> {
        self.write_artifact(ArtifactKind::Storage, &ArtifactBody::Storage(actions.to_vec()))
    }

    /// Every record must already be marked preserve (see
    /// [`StorageAction::into_preserved`]); this writer does not decide what to keep.
    pub fn write_preserved_actions(&self, actions: &[StorageAction]) -> Result<PathBuf> {
        self.write_artifact(ArtifactKind::Preserved, &ArtifactBody::Storage(actions.to_vec()))
    }

    pub fn write_network_actions(&self, actions: &[NetworkAction]) -> Result<PathBuf> {
        self.write_artifact(ArtifactKind::Network, &ArtifactBody::Network(actions.to_vec()))
    }

    /// Write the late commands that configure `user` in the target.
    pub fn write_postinstall(
        &self,
        user: &UserProvisioningInfo,
        config: &DriverConfig,
    ) -> Result<PathBuf> {
        let commands = postinstall::late_commands(user, config)?;
        self.write_artifact(ArtifactKind::Postinstall, &ArtifactBody::LateCommands(commands))
    }
}

/// Truncate, write, sync, close. Never edits in place.
pub(crate) fn write_replacing(path: &std::path::Path, content: &str) -> Result<()> {
    debug!("Writing {} bytes to {}", content.len(), path.display());
    let mut file = File::create(path).map_err(|e| DriverError::file_io(path, e))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| DriverError::file_io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{single_disk_layout, TargetDisk};
    use chrono::TimeZone;

    fn writer_in(dir: &std::path::Path) -> (ArtifactWriter, DriverConfig) {
        let config = DriverConfig {
            paths: ConfigPaths::in_dir(dir),
            ..DriverConfig::default()
        };
        (ArtifactWriter::new(&config), config)
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap()
    }

    fn layout() -> Vec<StorageAction> {
        single_disk_layout(&TargetDisk::new("/dev/sda", "QEMU HARDDISK", "QM00001")).unwrap()
    }

    #[test]
    fn test_indent_body() {
        assert_eq!(indent_body("- a: 1\n  b: 2\n"), "    - a: 1\n      b: 2\n");
        assert_eq!(indent_body("x: |\n  one\n\n  two\n"), "    x: |\n      one\n\n      two\n");
    }

    #[test]
    fn test_render_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer_in(dir.path());
        let body = ArtifactBody::Storage(layout());

        let first = writer.render(ArtifactKind::Storage, &body, fixed_time()).unwrap();
        let second = writer.render(ArtifactKind::Storage, &body, fixed_time()).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("# Autogenerated by subiquity: 2026-10-19 08:30:00.000000 UTC\n"));
        assert!(first.contains("\nstorage:\n  version: 1\n  config:\n    - type: disk\n"));
        assert!(!first.contains('{'), "flow style leaked into:\n{first}");
    }

    #[test]
    fn test_rendered_storage_parses_under_parent_key() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer_in(dir.path());
        let rendered = writer
            .render(ArtifactKind::Storage, &ArtifactBody::Storage(layout()), fixed_time())
            .unwrap();

        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(doc["storage"]["version"].as_u64(), Some(1));
        assert_eq!(doc["partitioning_commands"]["builtin"], "curtin block-meta custom");
        assert_eq!(doc["reporter"]["subiquity"]["progress"], serde_yaml::Value::Bool(true));
        let config: Vec<StorageAction> =
            serde_yaml::from_value(doc["storage"]["config"].clone()).unwrap();
        assert_eq!(config, layout());
    }

    #[test]
    fn test_preserved_requires_preserve_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());

        let err = writer.write_preserved_actions(&layout()).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
        assert!(!config.paths.artifact_path(ArtifactKind::Preserved).exists());

        let kept: Vec<StorageAction> = layout().into_iter().map(StorageAction::into_preserved).collect();
        let path = writer.write_preserved_actions(&kept).unwrap();
        assert!(path.ends_with("subiquity-config-storage-preserved.yaml"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\nstorage:\n  version: 1\n"));
        assert_eq!(content.matches("preserve: true").count(), kept.len());
    }

    #[test]
    fn test_body_must_match_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer_in(dir.path());
        let err = writer
            .write_artifact(ArtifactKind::Network, &ArtifactBody::Storage(layout()))
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }

    #[test]
    fn test_write_overwrites_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer_in(dir.path());

        let first = writer.write_storage_actions(&layout()).unwrap();
        let second = writer.write_storage_actions(&layout()[..1]).unwrap();
        assert_eq!(first, second);

        let content = std::fs::read_to_string(second).unwrap();
        assert_eq!(content.matches("# Autogenerated").count(), 1);
        assert!(!content.contains("type: partition"));
    }

    #[test]
    fn test_missing_directory_is_file_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer_in(&dir.path().join("does-not-exist"));
        let err = writer.write_storage_actions(&layout()).unwrap_err();
        assert!(matches!(err, DriverError::FileIo { .. }));
    }

    #[test]
    fn test_postinstall_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());
        let user = UserProvisioningInfo {
            username: "alice".into(),
            realname: "Alice A".into(),
            password: "$6$x$y".into(),
            hostname: "box".into(),
        };
        let path = writer.write_postinstall(&user, &config).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(!content.contains("partitioning_commands"));
        assert!(content.contains("\nlate_commands:\n"));
    }

    #[test]
    fn test_header_quotes_odd_progress_path() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _) = writer_in(dir.path());
        writer.paths.progress_path = PathBuf::from("/tmp/progress: log");
        let header = writer.header().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&header).unwrap();
        assert_eq!(doc["reporter"]["subiquity"]["path"], "/tmp/progress: log");
    }

    #[test]
    fn test_header_keeps_multiline_progress_path_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _) = writer_in(dir.path());
        writer.paths.progress_path = PathBuf::from("/tmp/progress\nlog");
        let header = writer.header().unwrap();
        assert!(header.contains("  path: \"/tmp/progress\\nlog\"\n"), "{header}");
        let doc: serde_yaml::Value = serde_yaml::from_str(&header).unwrap();
        assert_eq!(doc["reporter"]["subiquity"]["path"], "/tmp/progress\nlog");
        assert_eq!(doc["reporter"]["subiquity"]["progress"], serde_yaml::Value::Bool(true));
    }

    #[test]
    fn test_empty_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());

        let err = writer.write_storage_actions(&[]).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)), "{err:?}");
        assert!(!config.paths.artifact_path(ArtifactKind::Storage).exists());

        let err = writer.write_network_actions(&[]).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)), "{err:?}");
        assert!(!config.paths.artifact_path(ArtifactKind::Network).exists());

        let err = writer
            .render(ArtifactKind::Preserved, &ArtifactBody::Storage(Vec::new()), fixed_time())
            .unwrap_err();
        assert!(err.to_string().contains("no records"), "{err}");
    }
}
