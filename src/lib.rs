//! curtin driver library
//!
//! Turns validated installer state into the configuration files curtin
//! consumes, builds the curtin command line and drives one install attempt
//! through to an optional reboot.

pub mod action;
pub mod artifact;
pub mod cli;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod plan;
pub mod postinstall;
pub mod process_guard;
pub mod template;

// Re-export main types for convenience
pub use action::{
    single_disk_layout, ActionId, DiskBaseName, NetworkAction, StorageAction, TargetDisk,
};
pub use artifact::{ArtifactBody, ArtifactKind, ArtifactWriter};
pub use command::{build_install_command, InstallCommand};
pub use config::{ConfigPaths, DriverConfig};
pub use driver::{
    DriverStage, DriverTransitionError, InstallReport, ProcessDriver, ProvisioningStatus,
    RebootHandoff, RebootPolicy,
};
pub use error::DriverError;
pub use plan::InstallPlan;
pub use postinstall::{late_commands, seed_user_data, LateCommands, UserProvisioningInfo};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use template::TemplateRenderer;
