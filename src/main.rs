//! curtin-driver - Main entry point

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use curtin_driver::cli::{Cli, Commands};
use curtin_driver::template::verify_rendered;
use curtin_driver::{
    build_install_command, process_guard, DriverConfig, InstallPlan, ProcessDriver, RebootPolicy,
    TargetDisk, TemplateRenderer,
};

/// Initialize logging; RUST_LOG overrides the default `info` level
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logger();
    info!("curtin-driver starting up");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    // Forward SIGINT/SIGTERM to a running curtin process group
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let mut config = match &cli.config {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::default(),
    };
    if cli.dry_run {
        config.dry_run = true;
    }

    match cli.command {
        Commands::Install { plan, no_reboot } => {
            let policy = if no_reboot {
                RebootPolicy::Stay
            } else {
                RebootPolicy::Reboot
            };
            run_install(config, &plan, policy)
        }
        Commands::Validate { plan } => {
            info!("Validating install plan: {:?}", plan);
            match InstallPlan::load_from_file(&plan) {
                Ok(_) => {
                    println!("✓ Install plan is valid: {}", plan.display());
                    Ok(())
                }
                Err(e) => {
                    error!("Install plan validation failed: {:#}", e);
                    eprintln!("✗ Install plan is invalid: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::RenderStorage {
            disk,
            model,
            serial,
        } => {
            let renderer = TemplateRenderer::new(&config)?;
            let disk = TargetDisk {
                name: disk,
                model,
                serial,
            };
            if config.dry_run {
                let rendered = renderer.render(&disk, Utc::now())?;
                verify_rendered(&rendered, &disk)?;
                print!("{}", rendered);
            } else {
                let path = renderer
                    .render_disk_template(&disk)
                    .with_context(|| format!("Failed to render storage config for {}", disk.name))?;
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::ShowCommand { paths } => {
            println!("{}", build_install_command(&config, &paths[..]));
            Ok(())
        }
    }
}

/// Run one full install attempt for the plan at `plan_path`
fn run_install(config: DriverConfig, plan_path: &Path, policy: RebootPolicy) -> Result<()> {
    let plan = InstallPlan::load_from_file(plan_path)?;
    info!(
        "Installing to {} for user {}",
        plan.target_disk.name, plan.user.username
    );

    let mut driver = ProcessDriver::new(config);
    match driver.install(&plan, policy) {
        Ok(report) => {
            for path in &report.artifacts {
                debug!("Artifact: {}", path.display());
            }
            match report.reboot.and_then(|handoff| handoff.child()) {
                Some(pid) => println!("✓ Install complete, rebooting (PID {})", pid),
                None => println!("✓ Install complete"),
            }
            Ok(())
        }
        Err(e) => {
            error!("Driver stopped in stage '{}': {}", driver.stage(), e);
            eprintln!("✗ Install failed: {}", e);
            std::process::exit(1);
        }
    }
}
