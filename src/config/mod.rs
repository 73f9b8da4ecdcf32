//! Configuration management
//!
//! Configuration is read from a TOML file, then overridden by environment
//! variables prefixed with `YAKYAK_AUTH__` (`YAKYAK_AUTH__AUTHENTICATION__NO_403=true`).

use crate::domain::trusted_peers::TrustedHostSources;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "YAKYAK_AUTH";

/// Longest accepted nonce lifetime, one year
pub const MAX_CACHE_EXPIRE: u64 = 365 * 24 * 3600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Password file {path}, line {line}: {reason}")]
    PasswordFile {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Credential backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub global: GlobalConfig,
    pub authentication: AuthConfig,
    pub cluster: ClusterConfig,
    pub presence: PresenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GlobalConfig {
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: String,
    /// Period of the idle maintenance tick, in seconds
    pub idle_interval: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            idle_interval: 5,
        }
    }
}

/// Credential backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbImplementation {
    File,
    Memory,
    Postgres,
}

/// Options of the authentication module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    pub trusted_hosts: Vec<String>,
    pub db_implementation: DbImplementation,
    pub datasource: String,
    pub cache_expire: u64,
    pub reject_wrong_client_certificates: bool,
    pub tls_client_certificate_required_subject: String,
    pub new_auth_on_407: bool,
    pub enable_test_accounts_creation: bool,
    pub trusted_client_certificates: Vec<String>,
    pub trust_domain_certificates: bool,
    pub hashed_passwords: bool,
    pub available_algorithms: Vec<String>,
    pub disable_qop_auth: bool,
    pub no_403: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            trusted_hosts: Vec::new(),
            db_implementation: DbImplementation::File,
            datasource: String::new(),
            cache_expire: 1800,
            reject_wrong_client_certificates: false,
            tls_client_certificate_required_subject: String::new(),
            new_auth_on_407: false,
            enable_test_accounts_creation: false,
            trusted_client_certificates: Vec::new(),
            trust_domain_certificates: false,
            hashed_passwords: false,
            available_algorithms: vec!["MD5".to_string()],
            disable_qop_auth: false,
            no_403: false,
        }
    }
}

impl AuthConfig {
    /// Nonce lifetime from `cache-expire`
    pub fn nonce_lifetime(&self) -> Result<chrono::Duration, ConfigError> {
        if self.cache_expire == 0 || self.cache_expire > MAX_CACHE_EXPIRE {
            return Err(ConfigError::InvalidValue {
                key: "cache-expire",
                reason: format!("nonce lifetime must be between 1 and {} seconds", MAX_CACHE_EXPIRE),
            });
        }
        Ok(chrono::Duration::seconds(self.cache_expire as i64))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Addresses of the other proxies of the cluster
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PresenceConfig {
    pub enabled: bool,
    pub presence_server: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            presence_server: "<sip:127.0.0.1:5065;transport=tcp>".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .convert_case(config::Case::Kebab)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            key: "config",
            reason: e.to_string(),
        })
    }

    /// Check values that would only fail later, at commit time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authentication.available_algorithms.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "available-algorithms",
                reason: "at least one algorithm is required".to_string(),
            });
        }
        self.authentication.nonce_lifetime()?;
        if self.global.idle_interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "idle-interval",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Inputs of the trusted peer registry
    pub fn trusted_sources(&self) -> TrustedHostSources {
        TrustedHostSources {
            static_hosts: self.authentication.trusted_hosts.clone(),
            cluster_nodes: self.cluster.enabled.then(|| self.cluster.nodes.clone()),
            presence_server: (self.presence.enabled && !self.presence.presence_server.is_empty())
                .then(|| self.presence.presence_server.clone()),
        }
    }
}

/// Value type of a declared option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    Integer,
    String,
    StringList,
}

/// A recognized configuration option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: &'static str,
    pub description: &'static str,
    pub deprecated: bool,
}

const fn option(
    name: &'static str,
    kind: OptionKind,
    default: &'static str,
    description: &'static str,
) -> ConfigOption {
    ConfigOption {
        name,
        kind,
        default,
        description,
        deprecated: false,
    }
}

const fn deprecated(option: ConfigOption) -> ConfigOption {
    ConfigOption {
        deprecated: true,
        ..option
    }
}

/// Options of the `authentication` section
pub const AUTHENTICATION_OPTIONS: &[ConfigOption] = &[
    option(
        "trusted-hosts",
        OptionKind::StringList,
        "",
        "List of whitespace separated IP which will not be challenged.",
    ),
    option(
        "db-implementation",
        OptionKind::String,
        "file",
        "Credential backend: file, memory or postgres.",
    ),
    option(
        "datasource",
        OptionKind::String,
        "",
        "Backend specific location: password file path or database URL.",
    ),
    option(
        "cache-expire",
        OptionKind::Integer,
        "1800",
        "Lifetime of issued nonces, in seconds.",
    ),
    deprecated(option(
        "hashed-passwords",
        OptionKind::Boolean,
        "false",
        "True if retrieved passwords from the backend are hashed. Ignored, the backend tells.",
    )),
    option(
        "reject-wrong-client-certificates",
        OptionKind::Boolean,
        "false",
        "If set to true, the module will simply reject with 403 forbidden any request coming from client \
         who presented a bad TLS certificate. Otherwise, requests are challenged.",
    ),
    option(
        "tls-client-certificate-required-subject",
        OptionKind::String,
        "",
        "An optional regular expression matched against subjects of presented client certificates. \
         If empty, no post-check is done.",
    ),
    option(
        "new-auth-on-407",
        OptionKind::Boolean,
        "false",
        "When receiving a proxy authenticate challenge, generate a new challenge for this proxy.",
    ),
    option(
        "enable-test-accounts-creation",
        OptionKind::Boolean,
        "false",
        "Enable a feature useful for automatic tests, allowing a client to create a temporary account \
         with a REGISTER and a specific header. Never enable on a production server.",
    ),
    deprecated(option(
        "trusted-client-certificates",
        OptionKind::StringList,
        "",
        "List of whitespace separated username or username@domain CN which will trusted. \
         If no domain is given it is computed.",
    )),
    option(
        "trust-domain-certificates",
        OptionKind::Boolean,
        "false",
        "Accept requests from TLS clients whose certificate is issued for the domain of the request URI.",
    ),
    option(
        "available-algorithms",
        OptionKind::StringList,
        "MD5",
        "Digest algorithms offered in challenges, in order of preference: MD5, SHA-256.",
    ),
    option(
        "disable-qop-auth",
        OptionKind::Boolean,
        "false",
        "Do not offer qop=auth in challenges.",
    ),
    option(
        "no-403",
        OptionKind::Boolean,
        "false",
        "Challenge again instead of answering 403 Forbidden when a digest response is wrong.",
    ),
];

/// Look up a declared option by name
pub fn declared_option(name: &str) -> Option<&'static ConfigOption> {
    AUTHENTICATION_OPTIONS.iter().find(|o| o.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.authentication.cache_expire, 1800);
        assert_eq!(config.authentication.available_algorithms, vec!["MD5".to_string()]);
        assert!(!config.authentication.reject_wrong_client_certificates);
        assert!(!config.authentication.enable_test_accounts_creation);
        assert_eq!(config.authentication.db_implementation, DbImplementation::File);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_kebab_case() {
        let config = Config::from_toml(
            r#"
            [authentication]
            trusted-hosts = ["10.0.0.1"]
            db-implementation = "memory"
            cache-expire = 60
            new-auth-on-407 = true
            no-403 = true
            available-algorithms = ["SHA-256", "MD5"]

            [cluster]
            enabled = true
            nodes = ["10.0.0.2"]
            "#,
        )
        .unwrap();

        assert_eq!(config.authentication.trusted_hosts, vec!["10.0.0.1"]);
        assert_eq!(config.authentication.db_implementation, DbImplementation::Memory);
        assert_eq!(config.authentication.cache_expire, 60);
        assert!(config.authentication.new_auth_on_407);
        assert!(config.authentication.no_403);
        assert_eq!(config.global.idle_interval, 5);

        let sources = config.trusted_sources();
        assert_eq!(sources.cluster_nodes, Some(vec!["10.0.0.2".to_string()]));
        assert_eq!(sources.presence_server, None);
    }

    #[test]
    fn test_validation_errors() {
        assert!(Config::from_toml("[authentication]\navailable-algorithms = []\n").is_err());
        assert!(Config::from_toml("[authentication]\ncache-expire = 0\n").is_err());
        assert!(Config::from_toml("[authentication]\ncache-expire = 18446744073709551615\n").is_err());
        assert!(Config::from_toml(&format!("[authentication]\ncache-expire = {}\n", MAX_CACHE_EXPIRE + 1)).is_err());
        assert!(Config::from_toml(&format!("[authentication]\ncache-expire = {}\n", MAX_CACHE_EXPIRE)).is_ok());
        assert!(Config::from_toml("[authentication]\ndb-implementation = \"odbc\"\n").is_err());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let rendered = Config::default().to_toml().unwrap();
        assert_eq!(Config::from_toml(&rendered).unwrap(), Config::default());
    }

    #[test]
    fn test_declared_options() {
        assert_eq!(declared_option("cache-expire").unwrap().default, "1800");
        assert!(declared_option("hashed-passwords").unwrap().deprecated);
        assert!(declared_option("trusted-client-certificates").unwrap().deprecated);
        assert!(!declared_option("no-403").unwrap().deprecated);
        assert!(declared_option("unknown").is_none());
    }
}
