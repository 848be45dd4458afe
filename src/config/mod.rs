//! Configuration and environment discovery
//!
//! The daemon reads one TOML file for itself and one TOML file per named
//! service. The [`Environment`] resolves where those files live and which
//! user we run as; the core only ever consumes the parsed structs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Default directory for the control socket
pub const DEFAULT_SOCKET_DIRECTORY: &str = "/tmp/devoured";
/// Default control socket name, suffixed with the caller's uid
pub const DEFAULT_SOCKET_NAME: &str = "default";
/// Reserved target naming the daemon itself
pub const SELF_TARGET: &str = "devoured";

/// Daemon configuration from `config.toml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub control_socket_directory: PathBuf,
    pub control_socket_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_socket_directory: PathBuf::from(DEFAULT_SOCKET_DIRECTORY),
            control_socket_name: DEFAULT_SOCKET_NAME.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    socket: SocketSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SocketSection {
    path: PathBuf,
    name: String,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_DIRECTORY),
            name: DEFAULT_SOCKET_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load configuration; a missing file yields the defaults, an
    /// unparseable one is a setup error
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Ok(Config {
            control_socket_directory: file.socket.path,
            control_socket_name: file.socket.name,
        })
    }
}

/// Definition of one supervised service, from `<services>/<name>.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
    /// Working directory the child changes into before exec
    pub working_directory: PathBuf,
    /// Command to start the binary
    pub start_command: String,
    /// Arguments passed after `argv[0]`
    #[serde(default)]
    pub start_arguments: Vec<String>,
    /// Optional alternate stop command; graceful signal is used when absent
    #[serde(default)]
    pub stop_command: Option<String>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<ServiceConfig> {
        let content = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        toml::from_str(&content).map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }
}

/// Where configuration lives and who we run as
#[derive(Debug, Clone)]
pub struct Environment {
    user_id: u32,
    temp_directory: PathBuf,
    config_path: PathBuf,
    service_directory: PathBuf,
}

impl Environment {
    /// Discover the environment from the OS: uid, temp directory, and the
    /// per-user configuration directory
    pub fn discover() -> Result<Environment> {
        let user_id = nix::unistd::getuid().as_raw();
        let config_base = dirs::config_dir()
            .ok_or_else(|| Error::Config("no configuration directory available".into()))?
            .join("devoured");
        Ok(Environment {
            user_id,
            temp_directory: std::env::temp_dir(),
            config_path: config_base.join("config.toml"),
            service_directory: config_base.join("services"),
        })
    }

    /// Construct an explicit environment; used by tests and tools that
    /// point the daemon at a scratch directory
    pub fn with_paths(
        user_id: u32,
        temp_directory: PathBuf,
        config_path: PathBuf,
        service_directory: PathBuf,
    ) -> Environment {
        Environment {
            user_id,
            temp_directory,
            config_path,
            service_directory,
        }
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn temp_directory(&self) -> &Path {
        &self.temp_directory
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn service_directory(&self) -> &Path {
        &self.service_directory
    }

    pub fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_path)
    }

    /// Control socket path: configured directory + name, suffixed with the
    /// uid so concurrent users do not collide
    pub fn socket_path(&self, config: &Config) -> PathBuf {
        config
            .control_socket_directory
            .join(format!("{}-{}", config.control_socket_name, self.user_id))
    }

    /// Load a named service definition
    ///
    /// Names are plain identifiers; anything that could traverse the
    /// filesystem is rejected before touching it.
    pub fn load_service(&self, name: &str) -> Result<ServiceConfig> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(Error::Config(format!("invalid service name '{name}'")));
        }
        ServiceConfig::load(&self.service_directory.join(format!("{name}.toml")))
    }
}
