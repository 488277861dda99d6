//! Configuration management for stackvisor.
//!
//! This module resolves the per-user directory layout, loads the optional
//! `config.toml` settings file and parses group definition files into the ordered
//! command lists the supervisor operates on.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SupervisorError};
use crate::process::{CommandSpec, GroupMeta};

/// Environment variable overriding the per-user root directory.
pub const HOME_ENV: &str = "STACKVISOR_HOME";

pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_KEEP_RATIO: f64 = 0.5;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

/// Filesystem layout shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_dir: root.join("state"),
            log_dir: root.join("logs"),
            lock_dir: root.join("locks"),
            root,
        }
    }

    /// Resolves the root from `STACKVISOR_HOME`, falling back to the user config dir.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let config_dir = dirs::config_dir().ok_or_else(|| {
            SupervisorError::Config(format!(
                "could not determine a configuration directory; set {HOME_ENV}"
            ))
        })?;
        Ok(Self::new(config_dir.join("stackvisor")))
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

/// Tunables read from `config.toml`. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_max_bytes: u64,
    pub log_keep_ratio: f64,
    pub lock_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            log_keep_ratio: DEFAULT_LOG_KEEP_RATIO,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

impl Settings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Loads settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => {
            return Err(SupervisorError::config(
                format!("failed to read settings file {}", path.display()),
                err,
            ))
        }
    };
    toml::from_str(&raw).map_err(|err| {
        SupervisorError::config(
            format!("failed to parse settings file {}", path.display()),
            err,
        )
    })
}

/// Creates `path` (and parents) restricted to the owner.
pub(crate) fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| {
        SupervisorError::config(format!("failed to create directory {}", path.display()), err)
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|err| {
            SupervisorError::config(
                format!("failed to restrict permissions on {}", path.display()),
                err,
            )
        })?;
    }
    Ok(())
}

/// The ordered command list of one group plus its display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDefinition {
    pub key: String,
    pub meta: GroupMeta,
    pub commands: Vec<CommandSpec>,
}

/// Supplies group definitions to the command surface.
pub trait GroupResolver {
    fn resolve(&self, group: &str) -> Result<GroupDefinition>;
    fn group_names(&self) -> Vec<String>;
}

/// Top-level structure of a `stackvisor.toml` group file.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupsFile {
    #[serde(rename = "group", default)]
    pub groups: Vec<GroupConfig>,
}

/// Configuration for a single group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Key the group is locked and persisted under.
    pub name: String,
    /// Human-facing label.
    pub label: Option<String>,
    /// Repository the group belongs to.
    pub repository: Option<String>,
    /// Commands in start order.
    #[serde(rename = "command", default)]
    pub commands: Vec<CommandSpec>,
}

/// Resolves groups from a parsed group file.
#[derive(Debug, Clone)]
pub struct TomlGroupResolver {
    file: GroupsFile,
}

impl TomlGroupResolver {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            SupervisorError::config(format!("failed to read group file {}", path.display()), err)
        })?;
        Self::parse(&raw).map_err(|err| match err {
            SupervisorError::Config(message) => {
                SupervisorError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: GroupsFile = toml::from_str(raw)
            .map_err(|err| SupervisorError::config("failed to parse group file", err))?;
        for group in &file.groups {
            if group.name.trim().is_empty() {
                return Err(SupervisorError::Config("group name must not be empty".into()));
            }
            let mut seen = std::collections::HashSet::new();
            for command in &group.commands {
                let words = shell_words::split(&command.command).map_err(|err| {
                    SupervisorError::config(
                        format!("invalid command for '{}' in group '{}'", command.name, group.name),
                        err,
                    )
                })?;
                if words.is_empty() {
                    return Err(SupervisorError::Config(format!(
                        "empty command for '{}' in group '{}'",
                        command.name, group.name
                    )));
                }
                if !seen.insert(command.name.as_str()) {
                    return Err(SupervisorError::Config(format!(
                        "duplicate command '{}' in group '{}'",
                        command.name, group.name
                    )));
                }
            }
        }
        Ok(Self { file })
    }
}

impl GroupResolver for TomlGroupResolver {
    fn resolve(&self, group: &str) -> Result<GroupDefinition> {
        let config = self
            .file
            .groups
            .iter()
            .find(|g| g.name == group)
            .ok_or_else(|| SupervisorError::Config(format!("unknown group '{group}'")))?;
        Ok(GroupDefinition {
            key: config.name.clone(),
            meta: GroupMeta {
                group_key: Some(config.name.clone()),
                group_label: config.label.clone(),
                repository_name: config.repository.clone(),
                group_definition_name: Some(config.name.clone()),
            },
            commands: config.commands.clone(),
        })
    }

    fn group_names(&self) -> Vec<String> {
        self.file.groups.iter().map(|g| g.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "log_max_bytes = 2048\nstop_timeout_ms = 100\n").unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.log_max_bytes, 2048);
        assert_eq!(settings.stop_timeout(), Duration::from_millis(100));
        assert_eq!(settings.log_keep_ratio, DEFAULT_LOG_KEEP_RATIO);
        assert_eq!(settings.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn resolves_groups_in_declaration_order() {
        let raw = r#"
[[group]]
name = "app"
label = "My App"
repository = "acme/app"

[[group.command]]
name = "api"
command = "cargo run"
ports = [8080]
env = { RUST_LOG = "debug" }

[[group.command]]
name = "web"
command = "pnpm dev"
cwd = "web"
"#;
        let resolver = TomlGroupResolver::parse(raw).unwrap();
        assert_eq!(resolver.group_names(), vec!["app"]);
        let group = resolver.resolve("app").unwrap();
        assert_eq!(group.key, "app");
        assert_eq!(group.meta.group_label.as_deref(), Some("My App"));
        assert_eq!(group.meta.repository_name.as_deref(), Some("acme/app"));
        let names: Vec<_> = group.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
        assert_eq!(group.commands[0].ports, vec![8080]);
        assert_eq!(group.commands[0].env["RUST_LOG"], "debug");
        assert_eq!(group.commands[1].cwd.as_deref(), Some("web"));
    }

    #[test]
    fn rejects_duplicate_command_names() {
        let raw = r#"
[[group]]
name = "app"
[[group.command]]
name = "api"
command = "a"
[[group.command]]
name = "api"
command = "b"
"#;
        let err = TomlGroupResolver::parse(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate command 'api'"));
    }

    #[test]
    fn rejects_unparsable_commands() {
        let unbalanced = r#"
[[group]]
name = "app"
[[group.command]]
name = "api"
command = "echo 'oops"
"#;
        let err = TomlGroupResolver::parse(unbalanced).unwrap_err();
        assert!(err.to_string().contains("invalid command for 'api'"));

        let empty = r#"
[[group]]
name = "app"
[[group.command]]
name = "api"
command = "   "
"#;
        let err = TomlGroupResolver::parse(empty).unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn unknown_group_is_config_error() {
        let resolver = TomlGroupResolver::parse("").unwrap();
        let err = resolver.resolve("missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn paths_layout_under_root() {
        let paths = Paths::new("/tmp/sv");
        assert_eq!(paths.state_dir, PathBuf::from("/tmp/sv/state"));
        assert_eq!(paths.log_dir, PathBuf::from("/tmp/sv/logs"));
        assert_eq!(paths.lock_dir, PathBuf::from("/tmp/sv/locks"));
        assert_eq!(paths.settings_file(), PathBuf::from("/tmp/sv/config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        ensure_private_dir(&target).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
