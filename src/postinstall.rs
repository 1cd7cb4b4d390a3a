//! Late commands run by curtin inside the installed target.
//!
//! The order is fixed: set the hostname, seed cloud-init with the created
//! user, then disable and remove the installer itself. The last steps delete
//! the facility that ran the earlier ones, so nothing may be reordered.
//!
//! User-supplied values (hostname, the user-data document) reach `sh -c` as
//! positional parameters and are never spliced into shell text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};

/// Where cloud-init's NoCloud datasource looks for user-data in the target.
pub const USER_DATA_SEED_DIR: &str = "/var/lib/cloud/seed/nocloud-net";

/// Login shell of the created user.
pub const USER_SHELL: &str = "/bin/bash";
/// Supplementary group of the created user.
pub const USER_GROUPS: &str = "admin";

/// The user created on the installed system.
///
/// The password arrives already hashed (crypt format); it is only ever
/// written into the postinstall artifact.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProvisioningInfo {
    pub username: String,
    /// Display name, written as the user's gecos field
    #[serde(alias = "gecos")]
    pub realname: String,
    /// Pre-hashed password
    pub password: String,
    /// Hostname of the installed system
    pub hostname: String,
}

impl std::fmt::Debug for UserProvisioningInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserProvisioningInfo")
            .field("username", &self.username)
            .field("realname", &self.realname)
            .field("password", &"<redacted>")
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl UserProvisioningInfo {
    /// Check the values the late commands rely on.
    pub fn validate(&self) -> Result<()> {
        let username = self.username.as_str();
        if username.is_empty() {
            return Err(DriverError::validation("Username must be specified"));
        }
        if username.len() > 32 {
            return Err(DriverError::validation("Username must be at most 32 characters"));
        }
        let mut chars = username.chars();
        if !chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        {
            return Err(DriverError::validation(
                "Username must start with a lowercase letter or underscore",
            ));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
            return Err(DriverError::validation(
                "Username can only contain lowercase letters, numbers, '-' and '_'",
            ));
        }

        if self.realname.contains(['\n', '\r', ':']) {
            return Err(DriverError::validation(
                "Real name must not contain newlines or ':'",
            ));
        }

        if self.password.trim().is_empty() {
            return Err(DriverError::validation("Password hash must be specified"));
        }

        let hostname = self.hostname.as_str();
        if hostname.is_empty() || hostname.len() > 253 {
            return Err(DriverError::validation("Hostname must be 1-253 characters long"));
        }
        for label in hostname.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(DriverError::validation(
                    "Hostname labels between dots must be 1-63 characters long",
                ));
            }
            if label.starts_with('-')
                || label.ends_with('-')
                || !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(DriverError::validation(
                    "Hostname labels can only contain letters, numbers and '-' and must not start or end with '-'",
                ));
            }
        }
        Ok(())
    }
}

/// One entry of the cloud-config `users` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBlock {
    pub name: String,
    pub gecos: String,
    pub passwd: String,
    pub shell: String,
    pub groups: String,
    #[serde(rename = "lock-passwd")]
    pub lock_passwd: bool,
}

impl From<&UserProvisioningInfo> for UserBlock {
    fn from(user: &UserProvisioningInfo) -> Self {
        Self {
            name: user.username.clone(),
            gecos: user.realname.clone(),
            passwd: user.password.clone(),
            shell: USER_SHELL.to_string(),
            groups: USER_GROUPS.to_string(),
            lock_passwd: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    expire: bool,
}

#[derive(Debug, Serialize)]
struct CloudConfig {
    chpasswd: Chpasswd,
    users: Vec<UserBlock>,
}

/// Render the `#cloud-config` user-data document seeded into the target.
pub fn seed_user_data(user: &UserProvisioningInfo) -> Result<String> {
    let doc = CloudConfig {
        chpasswd: Chpasswd { expire: false },
        users: vec![UserBlock::from(user)],
    };
    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&doc)?))
}

/// Ordered `late_commands` mapping. Keys carry a numeric prefix so the
/// sorted map order is the execution order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LateCommands(BTreeMap<String, Vec<String>>);

impl LateCommands {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, name: &str, argv: Vec<String>) {
        self.0.insert(name.to_string(), argv);
    }
}

/// `curtin in-target -- <args>`
fn in_target<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ["curtin", "in-target", "--"]
        .into_iter()
        .map(String::from)
        .chain(args.into_iter().map(Into::into))
        .collect()
}

/// Build the late command sequence for `user`.
pub fn late_commands(user: &UserProvisioningInfo, config: &DriverConfig) -> Result<LateCommands> {
    user.validate()?;
    let user_data = seed_user_data(user)?;

    let mut commands = LateCommands::default();
    commands.push(
        "10_set_hostname",
        in_target([
            "sh",
            "-c",
            r#"printf '%s\n' "$1" > /etc/hostname"#,
            "set-hostname",
            user.hostname.as_str(),
        ]),
    );
    commands.push(
        "11_postinst_seed",
        in_target([
            "sh".to_string(),
            "-c".to_string(),
            format!(
                r#"mkdir -p {dir} && printf '%s' "$1" > {dir}/user-data"#,
                dir = USER_DATA_SEED_DIR
            ),
            "seed-user-data".to_string(),
            user_data,
        ]),
    );
    commands.push(
        "12_disable_installer",
        in_target(["systemctl", "disable", config.installer_service.as_str()]),
    );
    commands.push(
        "13_delete_installer",
        in_target([
            "rm".to_string(),
            "-f".to_string(),
            format!("/lib/systemd/system/{}", config.installer_service),
        ]),
    );
    commands.push(
        "14_remove_installer",
        in_target(
            [
                "sh",
                "-c",
                r#"for d in "$@"; do rm -rf "/usr/local/$d"; rm -rf /usr/local/bin/"$d"*; done"#,
                "remove-installer",
            ]
            .into_iter()
            .map(String::from)
            .chain(config.installer_components.iter().cloned()),
        ),
    );
    Ok(commands)
}
