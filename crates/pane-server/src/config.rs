//! Server configuration: TOML file + CLI overrides.

use crate::session::{SessionSettings, ShellSettings};
use pane_core::{PaneError, PaneResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_max_panes")]
    pub max_panes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            socket: None,
            max_panes: default_max_panes(),
        }
    }
}

/// `[shell]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellSection {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            term: default_term(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            event_queue: default_event_queue(),
            kill_timeout_ms: default_kill_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7681".to_string()
}
fn default_max_panes() -> usize {
    64
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_buffer_capacity() -> usize {
    1024 * 1024
}
fn default_event_queue() -> usize {
    256
}
fn default_kill_timeout_ms() -> u64 {
    2000
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}

/// Values given on the command line, which win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub socket: Option<String>,
    pub shell: Option<String>,
    pub buffer_capacity: Option<usize>,
    pub max_panes: Option<usize>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub socket: Option<PathBuf>,
    pub max_panes: usize,
    pub shutdown_timeout: Duration,
    pub session: SessionSettings,
}

/// Default config location.
pub fn default_config_path() -> PathBuf {
    expand_tilde("~/.paned/config.toml")
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> PaneResult<Self> {
        let path = config_path
            .map(|p| expand_tilde(&p.to_string_lossy()))
            .unwrap_or_else(default_config_path);

        let file = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            parse(&content)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };

        Self::resolve(file, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> PaneResult<Self> {
        let listen_str = overrides.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| PaneError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;
        let socket = overrides
            .socket
            .or(file.server.socket)
            .map(|s| expand_tilde(&s));
        let max_panes = overrides.max_panes.unwrap_or(file.server.max_panes);
        let buffer_capacity = overrides
            .buffer_capacity
            .unwrap_or(file.session.buffer_capacity);

        if max_panes == 0 {
            return Err(PaneError::Config("max_panes must be at least 1".into()));
        }
        if buffer_capacity == 0 {
            return Err(PaneError::Config("buffer_capacity must be positive".into()));
        }
        if file.session.event_queue < 2 {
            return Err(PaneError::Config("event_queue must be at least 2".into()));
        }

        let program = overrides
            .shell
            .or(file.shell.program)
            .unwrap_or_else(default_shell);
        let cwd = file
            .shell
            .cwd
            .map(|c| expand_tilde(&c))
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            listen,
            socket,
            max_panes,
            shutdown_timeout: Duration::from_millis(file.session.shutdown_timeout_ms),
            session: SessionSettings {
                shell: ShellSettings {
                    program,
                    args: file.shell.args,
                    term: file.shell.term,
                    cwd,
                    env: file.shell.env,
                },
                buffer_capacity,
                event_queue: file.session.event_queue,
                kill_timeout: Duration::from_millis(file.session.kill_timeout_ms),
            },
        })
    }
}

fn parse(content: &str) -> PaneResult<ConfigFile> {
    toml::from_str(content).map_err(|e| PaneError::Config(format!("config parse error: {e}")))
}

/// `$SHELL`, else `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ServerConfig::resolve(parse("").unwrap(), Overrides::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7681".parse().unwrap());
        assert!(config.socket.is_none());
        assert_eq!(config.max_panes, 64);
        assert_eq!(config.session.buffer_capacity, 1024 * 1024);
        assert_eq!(config.session.event_queue, 256);
        assert_eq!(config.session.kill_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.session.shell.term, "xterm-256color");
    }

    #[test]
    fn file_values_and_cli_overrides_merge() {
        let file = parse(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            max_panes = 8

            [shell]
            program = "/bin/bash"
            args = ["-l"]
            cwd = "/tmp"

            [shell.env]
            LANG = "C.UTF-8"

            [session]
            buffer_capacity = 4096
            kill_timeout_ms = 500
            "#,
        )
        .unwrap();
        let overrides = Overrides {
            shell: Some("/bin/sh".into()),
            max_panes: Some(2),
            ..Overrides::default()
        };
        let config = ServerConfig::resolve(file, overrides).unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.max_panes, 2);
        assert_eq!(config.session.shell.program, "/bin/sh");
        assert_eq!(config.session.shell.args, vec!["-l".to_string()]);
        assert_eq!(config.session.shell.cwd, PathBuf::from("/tmp"));
        assert_eq!(config.session.shell.env["LANG"], "C.UTF-8");
        assert_eq!(config.session.buffer_capacity, 4096);
        assert_eq!(config.session.kill_timeout, Duration::from_millis(500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_queue = parse("[session]\nevent_queue = 1\n").unwrap();
        assert!(matches!(
            ServerConfig::resolve(bad_queue, Overrides::default()),
            Err(PaneError::Config(_))
        ));

        let zero_capacity = Overrides {
            buffer_capacity: Some(0),
            ..Overrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), zero_capacity).is_err());

        let bad_listen = Overrides {
            listen: Some("not an address".into()),
            ..Overrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), bad_listen).is_err());

        assert!(matches!(
            parse("[server]\nport = 1\n"),
            Err(PaneError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file_and_missing_file_means_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_panes = 3").unwrap();
        let config = ServerConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(config.max_panes, 3);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = ServerConfig::load(Some(&missing), Overrides::default()).unwrap();
        assert_eq!(config.max_panes, 64);
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~/x/y"), home.join("x/y"));
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }
}
