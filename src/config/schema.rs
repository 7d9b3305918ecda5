use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "database.sqlite3";
pub const CONTROL_SOCKET: &str = "client.sock";
pub const COMMANDS_DIR: &str = "commands";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory - computed at load time, not serialized
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    pub server: ServerConfig,
    pub client: ClientConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Sections owned by plugins, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Verify the server certificate when `tls` is on (default: true)
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// What to do with commands sent to the bot directly rather than to a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivatePolicy {
    #[default]
    Allow,
    Deny,
    Only,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub nick: String,
    /// Channels to join on connect
    #[serde(default)]
    pub channels: Vec<String>,
    /// Owner address patterns (`nick!user@host`, `*` and `?` wildcards)
    #[serde(default)]
    pub owner: Vec<String>,
    /// Only treat the owner as authorised once identified to services
    #[serde(default)]
    pub owner_requires_auth: bool,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub private: PrivatePolicy,
    /// Pace outgoing lines to stay under server flood limits
    #[serde(default = "default_true")]
    pub flood_protection: bool,
    /// NickServ IDENTIFY password
    #[serde(default)]
    pub nickserv: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Wall-clock bound for authorised private invocations
    #[serde(default = "default_authorised_timeout_secs")]
    pub authorised_timeout_secs: u64,
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// No keepalive ping during the first seconds of a connection
    #[serde(default = "default_ping_grace_secs")]
    pub ping_grace_secs: u64,
    #[serde(default = "default_instance_check_secs")]
    pub instance_check_secs: u64,
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Bound on waiting for socket tasks to stop during a forced reconnect
    #[serde(default = "default_shutdown_wait_secs")]
    pub shutdown_wait_secs: u64,
}

fn default_port() -> u16 {
    6667
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    ".".into()
}

fn default_command_timeout_secs() -> u64 {
    12
}

fn default_authorised_timeout_secs() -> u64 {
    36
}

fn default_tick_millis() -> u64 {
    500
}

fn default_ping_interval_secs() -> u64 {
    180
}

fn default_pong_timeout_secs() -> u64 {
    30
}

fn default_ping_grace_secs() -> u64 {
    60
}

fn default_instance_check_secs() -> u64 {
    20
}

fn default_reconnect_initial_secs() -> u64 {
    3
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_shutdown_wait_secs() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            authorised_timeout_secs: default_authorised_timeout_secs(),
            tick_millis: default_tick_millis(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            ping_grace_secs: default_ping_grace_secs(),
            instance_check_secs: default_instance_check_secs(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
        }
    }
}

impl Config {
    /// `~/.tern`, the base directory used when none is given.
    pub fn default_base() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Ok(home.join(".tern"))
    }

    /// A fresh config for `base` with a random `ternNNNNN` nick.
    pub fn new_default(base: &Path) -> Self {
        let number = uuid::Uuid::new_v4().as_u128() % 100_000;
        Self {
            base_dir: base.to_path_buf(),
            config_path: base.join(CONFIG_FILE),
            server: ServerConfig {
                host: "irc.libera.chat".into(),
                port: default_port(),
                tls: false,
                verify_tls: true,
            },
            client: ClientConfig {
                nick: format!("tern{number:05}"),
                channels: vec!["#tern".into(), "#test".into()],
                owner: Vec::new(),
                owner_requires_auth: false,
                prefix: default_prefix(),
                private: PrivatePolicy::Allow,
                flood_protection: true,
                nickserv: None,
            },
            runtime: RuntimeConfig::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Create a new base directory with a default config and commands dir.
    /// Refuses to touch a directory that already exists.
    pub fn create(base: &Path) -> Result<Self> {
        if base.exists() {
            bail!(
                "The directory `{}` already exists; refusing to write into it",
                base.display()
            );
        }
        fs::create_dir_all(base.join(COMMANDS_DIR))
            .with_context(|| format!("Failed to create directory: {}", base.display()))?;
        let config = Self::new_default(base);
        config.save()?;
        Ok(config)
    }

    pub fn load(base: &Path) -> Result<Self> {
        let config_path = base.join(CONFIG_FILE);
        if !config_path.is_file() {
            bail!(
                "Missing config file `{}`. Is this a tern base directory? Use `tern create` to make one.",
                config_path.display()
            );
        }
        let contents = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let mut config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.base_dir = base.to_path_buf();
        config.config_path = config_path;
        Ok(config)
    }

    /// Write the config atomically: temp file, fsync, rename.
    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let temp_path = parent_dir.join(format!(".{CONFIG_FILE}.tmp-{}", uuid::Uuid::new_v4()));
        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            bail!("Failed to atomically replace config file: {e}");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join(DATABASE_FILE)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.base_dir.join(CONTROL_SOCKET)
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.base_dir.join(COMMANDS_DIR)
    }
}
