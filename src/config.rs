use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::sandbox::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS};

#[derive(Parser, Debug)]
#[command(name = "coderun", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Actually execute submitted code instead of returning a mock response
    #[arg(long = "allow-exec", env = "ALLOW_CODE_EXEC", default_value_t = false)]
    pub allow_exec: bool,

    /// Port to listen on, overrides the configuration file
    #[arg(long = "bind-port", short = 'p', env = "PORT")]
    pub bind_port: Option<u16>,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults when no file is given
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };

        if self.bind_port.is_some() {
            config.server.bind_port = self.bind_port;
        }
        config.sandbox.allow_exec |= self.allow_exec;

        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub auth: AuthConfig,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub allow_exec: bool,
    pub scratch_root: Option<PathBuf>,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
    pub node_command: String,
    pub python_command: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allow_exec: false,
            scratch_root: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            node_command: "node".to_string(),
            python_command: "python3".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Directory under which per-invocation workspaces are created
    pub fn scratch_root(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(root) = &self.scratch_root {
            return root.clone();
        }

        match ProjectDirs::from("", "", "coderun") {
            Some(proj_dirs) => proj_dirs.cache_dir().join("scratch"),
            None => std::env::temp_dir().join("coderun-scratch"),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer tokens; authentication is disabled when empty
    pub tokens: Vec<String>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn accepts(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}
