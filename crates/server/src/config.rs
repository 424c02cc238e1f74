//! Server configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub usb: UsbSettings,
    pub security: SecuritySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP port for USB/IP connections
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    /// Address to bind the listener to
    #[serde(default = "ServerSettings::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
    /// Maximum concurrent client sessions; connections beyond this are
    /// accepted and immediately dropped
    #[serde(default = "ServerSettings::default_max_sessions")]
    pub max_sessions: usize,
}

impl ServerSettings {
    fn default_port() -> u16 {
        protocol::DEFAULT_PORT
    }

    fn default_bind_addr() -> String {
        "0.0.0.0".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_max_sessions() -> usize {
        8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Time budget in milliseconds for string-descriptor fetches while
    /// exporting a device
    #[serde(default = "UsbSettings::default_string_wait_ms")]
    pub string_wait_ms: u64,
    /// VID:PID patterns selecting exportable devices (empty = all)
    #[serde(default)]
    pub filters: Vec<String>,
}

impl UsbSettings {
    fn default_string_wait_ms() -> u64 {
        2000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecuritySettings {
    /// Client IP addresses permitted to connect (empty = allow all)
    #[serde(default)]
    pub allowed_clients: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: ServerSettings::default_port(),
                bind_addr: ServerSettings::default_bind_addr(),
                log_level: ServerSettings::default_log_level(),
                max_sessions: ServerSettings::default_max_sessions(),
            },
            usb: UsbSettings {
                string_wait_ms: UsbSettings::default_string_wait_ms(),
                filters: Vec::new(),
            },
            security: SecuritySettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rust-usbip/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rust-usbip").join("server.toml")
        } else {
            PathBuf::from(".config/rust-usbip/server.toml")
        }
    }

    /// The socket address the listener binds
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.listen_addr()?;

        if self.server.max_sessions == 0 {
            return Err(anyhow!("max_sessions must be at least 1"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        for client in &self.security.allowed_clients {
            if client.is_empty() {
                return Err(anyhow!("Empty address in allowed_clients list"));
            }
            client
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid client address '{}'", client))?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Expand a user-supplied config path (`~/...`) into a real one
pub fn expand_config_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
