//! Provisioning tool invocation.
//!
//! Builds `<curtin> -v --showtrace [-c <path> ...] install <source>`.
//! Building is pure: config paths are not checked for existence, a missing
//! file surfaces later as curtin's own failure.
//!
//! # Ordering
//!
//! curtin merges `-c` configs left to right, later files overriding earlier
//! ones, so the `-c` pairs keep exactly the caller's order.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::config::DriverConfig;

/// Ordered argv for one curtin run. `tokens[0]` is the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCommand {
    tokens: Vec<String>,
}

impl InstallCommand {
    /// The executable path
    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    /// Arguments after the executable
    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    /// Executable followed by arguments
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Config paths in the order they were passed with `-c`
    pub fn config_paths(&self) -> impl Iterator<Item = &str> {
        // executable, -v, --showtrace, then `-c <path>` pairs
        self.tokens[3..]
            .chunks(2)
            .take_while(|pair| pair.len() == 2 && pair[0] == "-c")
            .map(|pair| pair[1].as_str())
    }
}

impl fmt::Display for InstallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Assemble the install command for `config_paths`, in order.
pub fn build_install_command<P: AsRef<Path>>(
    config: &DriverConfig,
    config_paths: &[P],
) -> InstallCommand {
    let mut tokens = Vec::with_capacity(5 + 2 * config_paths.len());
    tokens.push(config.provisioner.to_string_lossy().into_owned());
    tokens.push("-v".to_string());
    tokens.push("--showtrace".to_string());
    for path in config_paths {
        tokens.push("-c".to_string());
        tokens.push(path.as_ref().to_string_lossy().into_owned());
    }
    tokens.push("install".to_string());
    tokens.push(config.install_source.clone());

    let command = InstallCommand { tokens };
    info!("curtin install command: {}", command);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_command_shape() {
        let config = DriverConfig::default();
        let cmd = build_install_command(&config, &["/tmp/a.yaml", "/tmp/b.yaml"]);
        assert_eq!(
            cmd.tokens(),
            &[
                "/usr/local/curtin/bin/curtin",
                "-v",
                "--showtrace",
                "-c",
                "/tmp/a.yaml",
                "-c",
                "/tmp/b.yaml",
                "install",
                "cp:///media/root-ro",
            ]
        );
        assert_eq!(cmd.program(), "/usr/local/curtin/bin/curtin");
        assert_eq!(cmd.args()[0], "-v");
    }

    #[test]
    fn test_no_configs() {
        let config = DriverConfig::default();
        let cmd = build_install_command::<&str>(&config, &[]);
        assert_eq!(
            cmd.to_string(),
            "/usr/local/curtin/bin/curtin -v --showtrace install cp:///media/root-ro"
        );
        assert_eq!(cmd.config_paths().count(), 0);
    }

    #[test]
    fn test_order_is_preserved() {
        let config = DriverConfig::default();
        let ab = build_install_command(&config, &["a", "b"]);
        let ba = build_install_command(&config, &["b", "a"]);
        assert_eq!(ab.config_paths().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(ba.config_paths().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_missing_files_are_not_checked() {
        let config = DriverConfig::default();
        let paths = vec![PathBuf::from("/nonexistent/dir/storage.yaml")];
        let cmd = build_install_command(&config, &paths);
        assert_eq!(
            cmd.config_paths().collect::<Vec<_>>(),
            vec!["/nonexistent/dir/storage.yaml"]
        );
    }
}
