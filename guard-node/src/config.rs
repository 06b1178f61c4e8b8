use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for the proxy node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Listener and upstream settings
    pub proxy: ProxyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Authorization settings
    pub authorization: AuthorizationConfig,
    /// Group backend selection
    pub group_backend: GroupBackendConfig,
    /// LDAP settings, required when a LDAP group backend is configured
    pub ldap: Option<LdapConfig>,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Listener and upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on
    pub address: String,
    /// Port to listen on
    pub port: u16,
    /// Enable TLS termination
    pub secured: bool,
    /// Path to the TLS private key file
    pub private_key: Option<String>,
    /// Path to the TLS certificate file
    pub certificate: Option<String>,
    /// Upstream Elasticsearch nodes
    pub elasticsearch: Vec<String>,
    /// Upstream request timeout in seconds
    pub timeout_seconds: u64,
    /// Interval between upstream health probes in seconds
    pub health_probe_interval_seconds: u64,
    /// Addresses permitted without credentials, with the ports allowed for
    /// each (an empty list permits any port)
    pub allow_from: HashMap<String, Vec<u16>>,
    /// Proxies whose forwarded credentials are trusted, with the ports
    /// allowed for each (an empty list permits any port)
    pub trusted_proxies: HashMap<String, Vec<u16>>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log destination (console, file)
    pub log: String,
    /// Log file path, used with the file destination
    pub file: String,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// Authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Index holding the role configuration
    pub config_index: String,
    /// Let Kibana's query validator bypass inspection on the validate
    /// endpoint when the client may access scoring explanations of .kibana
    pub kibana_validate_bypass: bool,
}

/// Group backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupBackendConfig {
    /// Backend type (none, ldap, msldap)
    pub backend: String,
}

/// LDAP configuration for the group and authentication backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// URL pointing to the LDAP server
    pub url: String,
    /// DN with which to bind
    pub bind_dn: String,
    /// Password with which to bind
    pub bind_pw: String,
    /// Root DN of the directory
    pub root_dn: Option<String>,
    /// DN beneath which to locate users
    pub user_base_dn: String,
    /// DN beneath which to locate groups
    pub group_base_dn: String,
    /// Object class of a user entry
    pub user_object_class: Option<String>,
    /// Object class of a group entry
    pub group_object_class: Option<String>,
    /// Attribute holding a user's name
    pub user_name_attribute: Option<String>,
    /// Attribute holding a group's name
    pub group_name_attribute: Option<String>,
    /// Attribute holding a group's members
    pub group_membership_attribute: Option<String>,
    /// Role assigned to users without any role membership
    pub default_role: Option<String>,
}

impl LdapConfig {
    /// Resolve an optional attribute, applying the Active Directory
    /// defaults when the msldap flavor is configured
    fn resolved<'a>(
        &'a self,
        value: &'a Option<String>,
        msldap_default: &'a str,
        flavor: &str,
    ) -> Option<&'a str> {
        match value {
            Some(value) => Some(value.as_str()),
            None if flavor == "msldap" => Some(msldap_default),
            None => None,
        }
    }

    pub fn user_object_class(&self, flavor: &str) -> Option<&str> {
        self.resolved(&self.user_object_class, "user", flavor)
    }

    pub fn group_object_class(&self, flavor: &str) -> Option<&str> {
        self.resolved(&self.group_object_class, "group", flavor)
    }

    pub fn user_name_attribute(&self, flavor: &str) -> Option<&str> {
        self.resolved(&self.user_name_attribute, "sAMAccountName", flavor)
    }

    pub fn group_name_attribute(&self, flavor: &str) -> Option<&str> {
        self.resolved(&self.group_name_attribute, "sAMAccountName", flavor)
    }

    pub fn group_membership_attribute(&self, flavor: &str) -> Option<&str> {
        self.resolved(
            &self.group_membership_attribute,
            "member:1.2.840.113556.1.4.1941:",
            flavor,
        )
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Exporter listen address
    pub listen_addr: String,
}

impl GuardConfig {
    /// Load configuration from file with GUARD_* environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GUARD").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// The address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.address, self.proxy.port)
    }

    /// Upstream nodes, normalized to URLs
    pub fn elasticsearch_nodes(&self) -> Vec<String> {
        self.proxy
            .elasticsearch
            .iter()
            .map(|node| {
                let node = node.trim().trim_end_matches('/');
                if node.contains("://") {
                    node.to_string()
                } else {
                    format!("http://{node}")
                }
            })
            .collect()
    }

    /// Upstream request timeout as Duration
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_seconds)
    }

    /// Interval between upstream health probes as Duration
    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.health_probe_interval_seconds)
    }

    /// Whether TLS termination is enabled
    pub fn tls_enabled(&self) -> bool {
        self.proxy.secured
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.proxy.port == 0 {
            return Err("Listen port cannot be 0".to_string());
        }

        if self.proxy.elasticsearch.is_empty() {
            return Err("It is mandatory to provide at least one elasticsearch node".to_string());
        }

        if self.proxy.secured {
            if self.proxy.private_key.as_deref().unwrap_or("").is_empty() {
                return Err(
                    "TLS private key path cannot be empty when the listener is secured".to_string(),
                );
            }
            if self.proxy.certificate.as_deref().unwrap_or("").is_empty() {
                return Err(
                    "TLS certificate path cannot be empty when the listener is secured".to_string(),
                );
            }
        }

        match self.group_backend.backend.as_str() {
            "none" => {}
            flavor @ ("ldap" | "msldap") => {
                let Some(ldap) = &self.ldap else {
                    return Err("A LDAP group backend requires the ldap section".to_string());
                };
                if ldap.url.is_empty() {
                    return Err(
                        "It is mandatory to provide a proper URL pointing to the LDAP server"
                            .to_string(),
                    );
                }
                for (value, what) in [
                    (ldap.user_object_class(flavor), "a LDAP user's object class"),
                    (ldap.group_object_class(flavor), "a LDAP group's object class"),
                    (
                        ldap.user_name_attribute(flavor),
                        "an attribute where a user's name is stored",
                    ),
                    (
                        ldap.group_name_attribute(flavor),
                        "an attribute where a group's name is stored",
                    ),
                    (
                        ldap.group_membership_attribute(flavor),
                        "an attribute where a group's members are stored",
                    ),
                ] {
                    if value.is_none() {
                        return Err(format!("It is mandatory to provide {what}"));
                    }
                }
            }
            other => {
                return Err(format!(
                    "Invalid group backend \"{other}\" set. Valid backends are: none, ldap, msldap"
                ));
            }
        }

        if self.authorization.config_index.is_empty() {
            return Err("The configuration index cannot be empty".to_string());
        }

        match self.logging.log.as_str() {
            "console" | "file" => {}
            other => {
                return Err(format!(
                    "Invalid log type \"{other}\" set. Valid log types are: console, file"
                ));
            }
        }

        Ok(())
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig {
                address: "localhost".to_string(),
                port: 59200,
                secured: false,
                private_key: None,
                certificate: None,
                elasticsearch: vec!["localhost:9200".to_string()],
                timeout_seconds: 30,
                health_probe_interval_seconds: 15,
                allow_from: HashMap::new(),
                trusted_proxies: HashMap::new(),
            },
            logging: LoggingConfig {
                log: "console".to_string(),
                file: "/var/log/elasticguard/elasticguard.log".to_string(),
                level: "error".to_string(),
            },
            authorization: AuthorizationConfig {
                config_index: ".elasticguard".to_string(),
                kibana_validate_bypass: true,
            },
            group_backend: GroupBackendConfig {
                backend: "none".to_string(),
            },
            ldap: None,
            metrics: MetricsConfig {
                enabled: false,
                listen_addr: "127.0.0.1:9100".to_string(),
            },
        }
    }
}
