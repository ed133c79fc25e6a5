use std::fmt::{self, Debug};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pnet::util::MacAddr;
use serde::Deserialize;

use crate::common;
use crate::error::ConfigError;
use crate::ipmi::{self, PrivilegeLevel};
use crate::power;

const DEFAULT_HOST: &str = "192.168.0.1";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";
const DEFAULT_MAC: &str = "00:11:22:33:44:55";
const DEFAULT_WEB_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Listen for Wake-on-LAN packets and serve the web page
    #[default]
    Wol,
    /// Send one power-on through the BMC and exit
    Direct,
}

/// Powers on a server through its BMC when a Wake-on-LAN packet for it arrives.
///
/// Every option falls back to its environment variable, then to the config
/// file, then to the built-in default.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// BMC address [default: 192.168.0.1]
    #[arg(long, env = "IPMI_HOST")]
    pub host: Option<String>,

    /// BMC username [default: admin]
    #[arg(long, env = "IPMI_USERNAME")]
    pub username: Option<String>,

    /// BMC password [default: admin]
    #[arg(long, env = "IPMI_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// BMC port [default: 623]
    #[arg(long, env = "IPMI_PORT")]
    pub port: Option<u16>,

    /// Session privilege level [default: operator]
    #[arg(long, env = "IPMI_PRIVILEGE", value_enum)]
    pub privilege: Option<PrivilegeLevel>,

    /// Deadline for one connect, query and power-on sequence [default: 10]
    #[arg(long, env = "IPMI_TIMEOUT", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Target MAC address (00-11-22-33-44-55 or 00:11:22:33:44:55) [default: 00:11:22:33:44:55]
    #[arg(long, env = "WOL_MAC")]
    pub mac: Option<String>,

    /// UDP port to listen on for WoL packets [default: 9]
    #[arg(long, env = "WOL_PORT")]
    pub wol_port: Option<u16>,

    /// Address to bind the WoL listener to [default: 0.0.0.0]
    #[arg(long, env = "WOL_ADDR")]
    pub wol_addr: Option<IpAddr>,

    /// Also listen for raw Ethernet WoL frames on this interface (repeatable)
    #[arg(short, long = "interface", env = "WOL_INTERFACES", value_delimiter = ',')]
    pub interfaces: Vec<String>,

    /// Web server port [default: 80]
    #[arg(long, env = "WEB_PORT")]
    pub web_port: Option<u16>,

    /// Address to bind the web server to [default: 0.0.0.0]
    #[arg(long, env = "WEB_ADDR")]
    pub web_addr: Option<IpAddr>,

    /// Operation mode [default: wol]
    #[arg(long, env = "WOL_MODE", value_enum)]
    pub mode: Option<Mode>,

    /// YAML config file
    #[arg(short, long, env = "WOL_IPMI_CONFIG")]
    pub config: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info", value_parser = parse_level)]
    pub log_level: log::LevelFilter,
}

fn parse_level(text: &str) -> Result<log::LevelFilter, String> {
    text.parse().map_err(|_| format!("unknown log level '{text}'"))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct BmcSection {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    privilege: Option<PrivilegeLevel>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct Layer2Section {
    interfaces: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ListenSection {
    listen_addr: Option<IpAddr>,
    listen_port: Option<u16>,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    mode: Option<Mode>,
    target_mac: Option<String>,
    bmc: BmcSection,
    layer2: Layer2Section,
    layer4: ListenSection,
    web: ListenSection,
}

impl FileConfig {
    /// Reads a YAML file; `~` and `$VAR` in `path` are expanded.
    pub fn read(path: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::full(path).map_err(|_| ConfigError::ExpandPath(path.to_string()))?;
        let path = PathBuf::from(expanded.as_ref());
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::ReadFile { path: path.clone(), source })?;
        serde_yml::from_str(&text).map_err(|source| ConfigError::ParseFile { path, source })
    }
}

#[derive(Clone)]
pub struct BmcConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub privilege: PrivilegeLevel,
    pub timeout: Duration,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: ipmi::DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            privilege: PrivilegeLevel::default(),
            timeout: power::DEFAULT_TIMEOUT,
        }
    }
}

impl Debug for BmcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("privilege", &self.privilege)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Layer2Config {
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Layer4Config {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
}

impl Default for Layer4Config {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            listen_port: 9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            listen_port: DEFAULT_WEB_PORT,
        }
    }
}

/// Everything the process needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub bmc: BmcConfig,
    pub target_mac: MacAddr,
    pub layer2: Layer2Config,
    pub layer4: Layer4Config,
    pub web: WebConfig,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Flag or environment first, then the file, then the default.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = BmcConfig::default();
        let timeout_secs = cli.timeout
            .or(file.bmc.timeout_secs)
            .unwrap_or(defaults.timeout.as_secs());
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let bmc = BmcConfig {
            host: cli.host.clone().or(file.bmc.host).unwrap_or(defaults.host),
            port: cli.port.or(file.bmc.port).unwrap_or(defaults.port),
            username: cli.username.clone().or(file.bmc.username).unwrap_or(defaults.username),
            password: cli.password.clone().or(file.bmc.password).unwrap_or(defaults.password),
            privilege: cli.privilege.or(file.bmc.privilege).unwrap_or(defaults.privilege),
            timeout: Duration::from_secs(timeout_secs),
        };

        let mac_text = cli.mac.clone()
            .or(file.target_mac)
            .unwrap_or_else(|| DEFAULT_MAC.to_string());
        let target_mac = common::normalize_and_parse(&mac_text)
            .map_err(|source| ConfigError::InvalidMac { text: mac_text.clone(), source })?;

        let layer2 = Layer2Config {
            interfaces: if cli.interfaces.is_empty() { file.layer2.interfaces } else { cli.interfaces.clone() },
        };

        let l4_default = Layer4Config::default();
        let layer4 = Layer4Config {
            listen_addr: cli.wol_addr.or(file.layer4.listen_addr).unwrap_or(l4_default.listen_addr),
            listen_port: cli.wol_port.or(file.layer4.listen_port).unwrap_or(l4_default.listen_port),
        };

        let web_default = WebConfig::default();
        let web = WebConfig {
            listen_addr: cli.web_addr.or(file.web.listen_addr).unwrap_or(web_default.listen_addr),
            listen_port: cli.web_port.or(file.web.listen_port).unwrap_or(web_default.listen_port),
        };

        Ok(Self {
            mode: cli.mode.or(file.mode).unwrap_or_default(),
            bmc,
            target_mac,
            layer2,
            layer4,
            web,
        })
    }
}
