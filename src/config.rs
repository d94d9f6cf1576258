//! Daemon configuration.
//!
//! The configuration is read once at startup from a TOML file, overridden by
//! `IPOE_*` environment variables, validated, and then handed by reference to
//! each component. Nothing mutates it afterwards.

use std::{
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "ipoe-config.toml";
pub const DEFAULT_INTERFACE_NAME: &str = "ipoveremail0";
pub const DEFAULT_ARCHIVE_MAILBOX: &str = "IPOE-Processed";
pub const ENV_PREFIX: &str = "IPOE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// The ipoe daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the TUN interface to create.
    #[serde(alias = "interfacename")]
    pub interface_name: String,
    pub interface_address: Option<Ipv4Addr>,
    pub interface_netmask: Option<Ipv4Addr>,
    pub smtp: SmtpConfig,
    pub imap: ImapConfig,
    pub routing: RoutingConfig,
    pub archive: ArchiveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.into(),
            interface_address: None,
            interface_netmask: None,
            smtp: SmtpConfig::default(),
            imap: ImapConfig::default(),
            routing: RoutingConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// Outbound mail server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    /// Upgrade the session with STARTTLS before authenticating.
    pub starttls: bool,
    /// Name announced in `EHLO`.
    pub helo_name: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 587,
            username: String::new(),
            password: Secret::default(),
            starttls: true,
            helo_name: "localhost".into(),
        }
    }
}

/// Mailbox server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    /// Mailbox watched for inbound frames.
    pub mailbox: String,
    /// Connect with implicit TLS.
    pub tls: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 993,
            username: String::new(),
            password: Secret::default(),
            mailbox: "INBOX".into(),
            tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Base mailbox that all tunneled destinations are subaddressed on.
    #[serde(alias = "destemail")]
    pub dest_email: String,
    /// Sender address of outbound frames.
    #[serde(alias = "fromemail")]
    pub from_email: String,
    /// Leave out the `X-IPOE-*` diagnostic headers.
    pub low_visibility: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Mailbox processed messages are moved to.
    pub mailbox: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            mailbox: DEFAULT_ARCHIVE_MAILBOX.into(),
        }
    }
}

/// Where [Config::load] looks when no path is given, in order.
pub fn search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new("/etc/ipoe").join(CONFIG_FILE_NAME),
    ]
}

impl Config {
    /// Loads `path`, or the first file found in [search_paths], then applies
    /// environment overrides and validates the result.
    ///
    /// Without a path and without any file on the search path, the
    /// configuration comes from defaults and the environment alone.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match search_paths().into_iter().find(|path| path.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overrides fields from `IPOE_*` variables, looked up through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = var("INTERFACENAME") {
            self.interface_name = value;
        }
        if let Some((key, value)) = var("INTERFACE_ADDRESS") {
            self.interface_address = Some(parse(key, value)?);
        }
        if let Some((key, value)) = var("INTERFACE_NETMASK") {
            self.interface_netmask = Some(parse(key, value)?);
        }

        if let Some((_, value)) = var("SMTP_SERVER") {
            self.smtp.server = value;
        }
        if let Some((key, value)) = var("SMTP_PORT") {
            self.smtp.port = parse(key, value)?;
        }
        if let Some((_, value)) = var("SMTP_USERNAME") {
            self.smtp.username = value;
        }
        if let Some((_, value)) = var("SMTP_PASSWORD") {
            self.smtp.password = Secret::new(value);
        }
        if let Some((key, value)) = var("SMTP_STARTTLS") {
            self.smtp.starttls = parse(key, value)?;
        }

        if let Some((_, value)) = var("IMAP_SERVER") {
            self.imap.server = value;
        }
        if let Some((key, value)) = var("IMAP_PORT") {
            self.imap.port = parse(key, value)?;
        }
        if let Some((_, value)) = var("IMAP_USERNAME") {
            self.imap.username = value;
        }
        if let Some((_, value)) = var("IMAP_PASSWORD") {
            self.imap.password = Secret::new(value);
        }
        if let Some((_, value)) = var("IMAP_MAILBOX") {
            self.imap.mailbox = value;
        }
        if let Some((key, value)) = var("IMAP_TLS") {
            self.imap.tls = parse(key, value)?;
        }

        if let Some((_, value)) = var("ROUTING_DESTEMAIL") {
            self.routing.dest_email = value;
        }
        if let Some((_, value)) = var("ROUTING_FROMEMAIL") {
            self.routing.from_email = value;
        }
        if let Some((key, value)) = var("ROUTING_LOW_VISIBILITY") {
            self.routing.low_visibility = parse(key, value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("interface_name", &self.interface_name),
            ("smtp.server", &self.smtp.server),
            ("imap.server", &self.imap.server),
            ("imap.mailbox", &self.imap.mailbox),
            ("routing.from_email", &self.routing.from_email),
            ("archive.mailbox", &self.archive.mailbox),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is required")));
            }
        }
        if !self.routing.dest_email.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "routing.dest_email {:?} must be a mailbox address",
                self.routing.dest_email
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: String, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
