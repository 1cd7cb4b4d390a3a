use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// curtin-driver - write curtin configuration and drive an install
#[derive(Parser)]
#[command(name = "curtin-driver")]
#[command(about = "Generates curtin configs from installer state and runs the install")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: write every artifact and log the curtin command, but
    /// never launch curtin or reboot.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Driver configuration file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write all artifacts for a plan, run curtin, then reboot on success
    Install {
        /// Install plan (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Stay up after a successful install instead of rebooting
        #[arg(long)]
        no_reboot: bool,
    },
    /// Validate an install plan without writing anything
    Validate {
        /// Install plan (JSON)
        plan: PathBuf,
    },
    /// Render the single-disk storage artifact for one disk
    RenderStorage {
        /// Disk device (e.g., /dev/sda)
        #[arg(short, long)]
        disk: String,
        /// Disk model as reported by the kernel
        #[arg(short, long)]
        model: Option<String>,
        /// Disk serial as reported by the kernel
        #[arg(short, long)]
        serial: Option<String>,
    },
    /// Print the curtin command for a set of config files, in order
    ShowCommand {
        /// Config files passed with -c, in merge order
        paths: Vec<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
