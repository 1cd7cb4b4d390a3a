//! Install attempt lifecycle.
//!
//! `ProcessDriver` owns the stage of one install attempt and is the only way
//! to move it. Stages only move forward; a failed or finished attempt must be
//! reset explicitly before the next one.
//!
//! # Stage Flow
//!
//! ```text
//! Idle
//!   ↓
//! ConfigWriting ──→ Failed
//!   ↓
//! Invoking ──────→ Failed
//!   ↓
//! Succeeded ─────→ Terminal   (reboot not requested)
//!   ↓
//! Rebooting
//!   ↓
//! Terminal
//! ```
//!
//! A non-zero exit of the provisioning tool always ends in `Failed`, from
//! which `Rebooting` is unreachable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{setsid, Pid};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactWriter;
use crate::command::{build_install_command, InstallCommand};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::plan::InstallPlan;
use crate::process_guard::{CommandProcessGroup, TrackedChild};
use crate::template::TemplateRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStage {
    Idle,
    /// Artifacts are being generated
    ConfigWriting,
    /// The provisioning tool is running
    Invoking,
    Succeeded,
    /// Terminal until reset
    Failed,
    /// Reboot child is being handed off
    Rebooting,
    /// Terminal until reset
    Terminal,
}

impl DriverStage {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminal)
    }

    /// Whether `self -> to` is an edge of the stage graph
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::ConfigWriting)
                | (Self::ConfigWriting, Self::Invoking)
                | (Self::ConfigWriting, Self::Failed)
                | (Self::Invoking, Self::Succeeded)
                | (Self::Invoking, Self::Failed)
                | (Self::Succeeded, Self::Rebooting)
                | (Self::Succeeded, Self::Terminal)
                | (Self::Rebooting, Self::Terminal)
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ConfigWriting => "Writing configuration",
            Self::Invoking => "Running curtin",
            Self::Succeeded => "Install succeeded",
            Self::Failed => "Install failed",
            Self::Rebooting => "Rebooting",
            Self::Terminal => "Done",
        }
    }
}

impl fmt::Display for DriverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverTransitionError {
    #[error("Cannot leave terminal stage {from} without a reset")]
    FromTerminalState { from: DriverStage },

    #[error("Cannot go from {from} to {to}")]
    InvalidTransition { from: DriverStage, to: DriverStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: DriverStage },
}

/// Outcome of one provisioning tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningStatus {
    /// `None` if the tool was killed by a signal
    pub exit_code: Option<i32>,
    pub stderr: String,
    /// False for a dry run, where nothing was executed
    pub launched: bool,
}

impl ProvisioningStatus {
    fn skipped() -> Self {
        Self {
            exit_code: Some(0),
            stderr: String::new(),
            launched: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a failed run into `DriverError::Provisioning`.
    pub fn ensure_success(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(DriverError::Provisioning {
                code: self.exit_code,
                stderr: self.stderr.clone(),
            })
        }
    }
}

/// Receipt for a reboot request.
///
/// The reboot command runs as a detached session leader that nobody waits
/// on. Once this value exists the parent has handed the request off for
/// good: whether the reboot command then succeeds is only visible in its own
/// output and exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootHandoff {
    child: Option<Pid>,
}

impl RebootHandoff {
    /// Pid of the reboot child; `None` on a dry run
    pub fn child(&self) -> Option<Pid> {
        self.child
    }
}

/// What to do after the provisioning tool succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebootPolicy {
    #[default]
    Reboot,
    Stay,
}

/// Everything one `install` call produced.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub artifacts: Vec<PathBuf>,
    pub command: InstallCommand,
    pub status: ProvisioningStatus,
    pub reboot: Option<RebootHandoff>,
}

/// Drives one install attempt at a time.
#[derive(Debug)]
pub struct ProcessDriver {
    config: DriverConfig,
    stage: DriverStage,
    /// (stage, unix timestamp) for every stage entered
    stage_history: Vec<(DriverStage, u64)>,
}

impl ProcessDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            stage: DriverStage::Idle,
            stage_history: Vec::with_capacity(8),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[inline]
    pub fn stage(&self) -> DriverStage {
        self.stage
    }

    pub fn stage_history(&self) -> &[(DriverStage, u64)] {
        &self.stage_history
    }

    fn transition_to(&mut self, target: DriverStage) -> std::result::Result<(), DriverTransitionError> {
        if self.stage.is_terminal() {
            return Err(DriverTransitionError::FromTerminalState { from: self.stage });
        }
        if target == self.stage {
            return Err(DriverTransitionError::AlreadyAtStage { stage: target });
        }
        if !self.stage.can_transition_to(target) {
            return Err(DriverTransitionError::InvalidTransition {
                from: self.stage,
                to: target,
            });
        }
        self.enter(target);
        Ok(())
    }

    fn enter(&mut self, stage: DriverStage) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        debug!("Driver stage: {} -> {}", self.stage, stage);
        self.stage_history.push((stage, timestamp));
        self.stage = stage;
    }

    fn fail(&mut self) {
        if self.stage.can_transition_to(DriverStage::Failed) {
            self.enter(DriverStage::Failed);
        } else {
            warn!("Cannot mark driver failed from stage {}", self.stage);
        }
    }

    /// Return to `Idle` after a failed or finished attempt.
    pub fn reset(&mut self) -> std::result::Result<(), DriverTransitionError> {
        match self.stage {
            DriverStage::Failed | DriverStage::Terminal => {
                info!("Resetting driver from {}", self.stage);
                self.enter(DriverStage::Idle);
                Ok(())
            }
            DriverStage::Idle => Err(DriverTransitionError::AlreadyAtStage {
                stage: DriverStage::Idle,
            }),
            from => Err(DriverTransitionError::InvalidTransition {
                from,
                to: DriverStage::Idle,
            }),
        }
    }

    /// Write every artifact `plan` needs and return their paths in `-c` order:
    /// network, storage, preserved storage, postinstall.
    ///
    /// Storage comes from the plan's records when present, otherwise from the
    /// single-disk template. Any error leaves the driver `Failed`.
    pub fn write_configs(&mut self, plan: &InstallPlan) -> Result<Vec<PathBuf>> {
        self.transition_to(DriverStage::ConfigWriting)?;
        match self.generate_artifacts(plan) {
            Ok(paths) => Ok(paths),
            Err(e) => {
                error!("Artifact generation failed: {}", e);
                self.fail();
                Err(e)
            }
        }
    }

    fn generate_artifacts(&self, plan: &InstallPlan) -> Result<Vec<PathBuf>> {
        plan.validate()?;
        let writer = ArtifactWriter::new(&self.config);
        let mut paths = Vec::with_capacity(4);

        if !plan.network.is_empty() {
            paths.push(writer.write_network_actions(&plan.network)?);
        }
        let storage = match &plan.storage {
            Some(actions) => writer.write_storage_actions(actions)?,
            None => TemplateRenderer::new(&self.config)?.render_disk_template(&plan.target_disk)?,
        };
        paths.push(storage);
        if !plan.preserved.is_empty() {
            paths.push(writer.write_preserved_actions(&plan.preserved)?);
        }
        paths.push(writer.write_postinstall(&plan.user, &self.config)?);
        Ok(paths)
    }

    /// Run the provisioning tool to completion.
    ///
    /// A non-zero exit is returned as a status, not an error, and leaves the
    /// driver `Failed`. An error means the tool could not be run at all.
    pub fn run_install(&mut self, command: &InstallCommand) -> Result<ProvisioningStatus> {
        self.transition_to(DriverStage::Invoking)?;

        if self.config.dry_run {
            info!("Dry run, not launching: {}", command);
            self.transition_to(DriverStage::Succeeded)?;
            return Ok(ProvisioningStatus::skipped());
        }

        info!("Launching provisioner: {}", command);
        let output = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .and_then(|child| {
                let _tracked = TrackedChild::track(child.id());
                child.wait_with_output()
            });

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                error!("Could not run {}: {}", command.program(), source);
                self.fail();
                return Err(DriverError::Spawn {
                    program: command.program().to_string(),
                    source,
                });
            }
        };

        let status = ProvisioningStatus {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            launched: true,
        };
        if status.success() {
            info!("curtin install finished successfully");
            self.transition_to(DriverStage::Succeeded)?;
        } else {
            error!(
                "curtin install failed with {}: {}",
                output.status,
                status.stderr.trim()
            );
            self.fail();
        }
        Ok(status)
    }

    /// Hand the reboot off to a detached child and return without waiting.
    ///
    /// Only valid after a successful run.
    pub fn reboot(&mut self) -> Result<RebootHandoff> {
        self.transition_to(DriverStage::Rebooting)?;

        if self.config.dry_run {
            info!("Dry run, not rebooting");
            self.transition_to(DriverStage::Terminal)?;
            return Ok(RebootHandoff { child: None });
        }

        let dispatched = dispatch_reboot(&self.config.reboot_command);
        self.transition_to(DriverStage::Terminal)?;
        let child = dispatched?;
        info!("Reboot handed off to PID {}", child);
        Ok(RebootHandoff { child: Some(child) })
    }

    /// Finish a successful attempt without rebooting.
    pub fn finish(&mut self) -> Result<()> {
        self.transition_to(DriverStage::Terminal)?;
        Ok(())
    }

    /// Full pipeline: write artifacts, build the command, run it, then
    /// reboot per `policy`. A failed run is returned as
    /// `DriverError::Provisioning` and never reboots.
    pub fn install(&mut self, plan: &InstallPlan, policy: RebootPolicy) -> Result<InstallReport> {
        let artifacts = self.write_configs(plan)?;
        let command = build_install_command(&self.config, &artifacts[..]);
        let status = self.run_install(&command)?;
        status.ensure_success()?;

        let reboot = match policy {
            RebootPolicy::Reboot => Some(self.reboot()?),
            RebootPolicy::Stay => {
                self.finish()?;
                None
            }
        };
        Ok(InstallReport {
            artifacts,
            command,
            status,
            reboot,
        })
    }
}

/// Start the reboot command in its own session and leave it running.
fn dispatch_reboot(command: &Path) -> Result<Pid> {
    info!("Rebooting with {}", command.display());
    let mut reboot = Command::new(command);
    reboot.stdin(Stdio::null());
    spawn_detached(reboot).map_err(|e| {
        warn!("Failed to start {}: {}", command.display(), e);
        DriverError::Reboot(format!("failed to start {}: {}", command.display(), e))
    })
}

/// Spawn `command` as a session leader and drop its handle unwaited.
///
/// The forked child only calls `setsid` before exec, so no lock held by
/// another thread at fork time can stall it.
fn spawn_detached(mut command: Command) -> std::io::Result<Pid> {
    use std::os::unix::process::CommandExt;
    // SAFETY: the closure only calls setsid, which is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            // Leave the installer's session so its teardown cannot take the reboot with it
            setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    let child = command.spawn()?;
    // Dropping a std Child neither kills nor waits on it
    Ok(Pid::from_raw(child.id() as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TargetDisk;
    use crate::config::ConfigPaths;
    use crate::postinstall::UserProvisioningInfo;
    use nix::sys::wait::{waitpid, WaitStatus};

    fn config_in(dir: &Path, provisioner: &str, reboot: &str) -> DriverConfig {
        DriverConfig {
            paths: ConfigPaths::in_dir(dir),
            provisioner: PathBuf::from(provisioner),
            reboot_command: PathBuf::from(reboot),
            ..DriverConfig::default()
        }
    }

    fn plan() -> InstallPlan {
        InstallPlan {
            target_disk: TargetDisk::new("/dev/sda", "QEMU HARDDISK", "QM00001"),
            user: UserProvisioningInfo {
                username: "alice".into(),
                realname: "Alice A".into(),
                password: "$6$salt$hash".into(),
                hostname: "alice-pc".into(),
            },
            network: Vec::new(),
            storage: None,
            preserved: Vec::new(),
        }
    }

    fn visited(driver: &ProcessDriver) -> Vec<DriverStage> {
        driver.stage_history().iter().map(|(s, _)| *s).collect()
    }

    #[test]
    fn test_stage_graph() {
        use DriverStage::*;
        assert!(Idle.can_transition_to(ConfigWriting));
        assert!(Invoking.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(Rebooting));
        assert!(!Failed.can_transition_to(Rebooting));
        assert!(!Idle.can_transition_to(Invoking));
        assert!(!Invoking.can_transition_to(Rebooting));
        assert!(Failed.is_terminal());
        assert!(Terminal.is_terminal());
        assert!(!Rebooting.is_terminal());
    }

    #[test]
    fn test_cannot_skip_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/true", "/bin/true"));

        let err = driver.reboot().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Transition(DriverTransitionError::InvalidTransition {
                from: DriverStage::Idle,
                to: DriverStage::Rebooting
            })
        ));

        let cmd = build_install_command::<&str>(driver.config(), &[]);
        assert!(driver.run_install(&cmd).is_err());
        assert_eq!(driver.stage(), DriverStage::Idle);
    }

    #[test]
    fn test_successful_install_without_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/true", "/bin/false"));

        let report = driver.install(&plan(), RebootPolicy::Stay).unwrap();
        assert!(report.status.success());
        assert!(report.status.launched);
        assert!(report.reboot.is_none());
        assert_eq!(report.artifacts.len(), 2);
        assert!(report.artifacts.iter().all(|p| p.exists()));
        assert_eq!(
            report.command.config_paths().collect::<Vec<_>>(),
            report
                .artifacts
                .iter()
                .map(|p| p.to_str().unwrap())
                .collect::<Vec<_>>()
        );
        assert_eq!(driver.stage(), DriverStage::Terminal);
        assert_eq!(
            visited(&driver),
            vec![
                DriverStage::ConfigWriting,
                DriverStage::Invoking,
                DriverStage::Succeeded,
                DriverStage::Terminal
            ]
        );
    }

    #[test]
    fn test_failed_install_never_reboots() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/false", "/bin/true"));

        let err = driver.install(&plan(), RebootPolicy::Reboot).unwrap_err();
        assert!(matches!(err, DriverError::Provisioning { code: Some(1), .. }));
        assert_eq!(driver.stage(), DriverStage::Failed);
        assert!(!visited(&driver).contains(&DriverStage::Rebooting));

        let err = driver.reboot().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Transition(DriverTransitionError::FromTerminalState {
                from: DriverStage::Failed
            })
        ));
    }

    #[test]
    fn test_run_install_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/false", "/bin/true"));
        driver.write_configs(&plan()).unwrap();
        let cmd = build_install_command::<&str>(driver.config(), &[]);

        let status = driver.run_install(&cmd).unwrap();
        assert!(!status.success());
        assert_eq!(status.exit_code, Some(1));
        assert_eq!(driver.stage(), DriverStage::Failed);
        assert!(status.ensure_success().is_err());
    }

    #[test]
    fn test_missing_provisioner_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver =
            ProcessDriver::new(config_in(dir.path(), "/nonexistent/curtin", "/bin/true"));

        let err = driver.install(&plan(), RebootPolicy::Reboot).unwrap_err();
        assert!(matches!(err, DriverError::Spawn { .. }));
        assert_eq!(driver.stage(), DriverStage::Failed);
    }

    #[test]
    fn test_generation_error_stops_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        // A launched provisioner would surface as a Spawn error instead
        let mut driver =
            ProcessDriver::new(config_in(dir.path(), "/nonexistent/curtin", "/bin/true"));
        let mut p = plan();
        p.target_disk.serial = None;

        let err = driver.install(&p, RebootPolicy::Reboot).unwrap_err();
        assert!(matches!(err, DriverError::Template(_)), "{err}");
        assert!(err.is_generation_error());
        assert_eq!(driver.stage(), DriverStage::Failed);
        assert!(!visited(&driver).contains(&DriverStage::Invoking));
    }

    #[test]
    fn test_reboot_child_is_handed_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/true", "/bin/true"));

        let report = driver.install(&plan(), RebootPolicy::Reboot).unwrap();
        let child = report.reboot.and_then(|h| h.child()).expect("reboot child");
        assert_eq!(driver.stage(), DriverStage::Terminal);
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
    }

    #[test]
    fn test_reboot_command_failure_is_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/true", "/bin/false"));

        let report = driver.install(&plan(), RebootPolicy::Reboot).unwrap();
        let child = report.reboot.and_then(|h| h.child()).expect("reboot child");
        assert_eq!(driver.stage(), DriverStage::Terminal);
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 1));
    }

    #[test]
    fn test_missing_reboot_command_is_reported_after_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver =
            ProcessDriver::new(config_in(dir.path(), "/bin/true", "/nonexistent/reboot"));

        let err = driver.install(&plan(), RebootPolicy::Reboot).unwrap_err();
        assert!(matches!(err, DriverError::Reboot(_)), "{err:?}");
        assert_eq!(driver.stage(), DriverStage::Terminal);
    }

    #[test]
    fn test_detached_child_leads_its_own_session() {
        let mut sleeper = Command::new("sleep");
        sleeper.arg("30");
        let child = spawn_detached(sleeper).unwrap();

        assert_ne!(nix::unistd::getsid(None).unwrap(), child);
        assert_eq!(nix::unistd::getsid(Some(child)).unwrap(), child);

        nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL).unwrap();
        assert!(matches!(
            waitpid(child, None).unwrap(),
            WaitStatus::Signaled(pid, nix::sys::signal::Signal::SIGKILL, _) if pid == child
        ));
    }

    #[test]
    fn test_dry_run_writes_but_never_launches() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path(), "/nonexistent/curtin", "/nonexistent/reboot");
        config.dry_run = true;
        let mut driver = ProcessDriver::new(config);

        let report = driver.install(&plan(), RebootPolicy::Reboot).unwrap();
        assert!(!report.status.launched);
        assert_eq!(report.reboot.and_then(|h| h.child()), None);
        assert!(report.artifacts.iter().all(|p| p.exists()));
        assert_eq!(driver.stage(), DriverStage::Terminal);
    }

    #[test]
    fn test_reset_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = ProcessDriver::new(config_in(dir.path(), "/bin/false", "/bin/true"));
        assert!(driver.reset().is_err());

        driver.install(&plan(), RebootPolicy::Stay).unwrap_err();
        driver.reset().unwrap();
        assert_eq!(driver.stage(), DriverStage::Idle);

        // Retried attempt rewrites the same artifacts
        let paths = driver.write_configs(&plan()).unwrap();
        assert!(paths.iter().all(|p| p.exists()));
        assert_eq!(driver.stage(), DriverStage::ConfigWriting);
        assert!(matches!(
            driver.reset(),
            Err(DriverTransitionError::InvalidTransition { .. })
        ));
    }
}
