use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Service user the init system should run the daemon as. Privilege
    /// dropping itself is left to the init system.
    pub user: String,
    pub max_connections: usize,
    /// Learning-mode window in minutes.
    pub learning_period: u64,
    pub require_sasl: bool,
    pub reject_message: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// RFC 822 From line used on every generated mail.
    pub sender: String,
    pub pid_file: String,
    pub log_file: Option<String>,
    pub spool_dir: String,
    pub config_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 10035,
            user: "postwhite".to_string(),
            max_connections: 10,
            learning_period: 30,
            require_sasl: true,
            reject_message: "User unknown in local recipient table".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            sender: "Postwhite <postwhite@localhost>".to_string(),
            pid_file: "/var/run/postwhite.pid".to_string(),
            log_file: None,
            spool_dir: "/var/spool/postwhite".to_string(),
            config_dir: "/etc/postwhite".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn recipients_path(&self) -> PathBuf {
        Path::new(&self.config_dir).join("recipients.yml")
    }

    pub fn messages_path(&self) -> PathBuf {
        Path::new(&self.config_dir).join("messages.yml")
    }

    pub fn learning_period_secs(&self) -> u64 {
        self.learning_period * 60
    }
}

/// The set of protected recipients, mapping each address to the SASL
/// identity expected on its command messages (if any). Loaded once at
/// startup and immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    recipients: HashMap<String, Option<String>>,
}

impl Registry {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let raw: HashMap<String, Option<String>> = serde_yaml::from_str(&content)?;
        Ok(Self::from_map(raw))
    }

    /// Addresses are canonicalized to lowercase so registry membership
    /// matches the lowercased request attributes.
    pub fn from_map(raw: HashMap<String, Option<String>>) -> Self {
        let recipients = raw
            .into_iter()
            .map(|(addr, sasl)| (addr.to_lowercase(), sasl))
            .collect();
        Registry { recipients }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.recipients.contains_key(address)
    }

    pub fn expected_sasl(&self, address: &str) -> Option<&str> {
        self.recipients.get(address)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 10035);
        assert_eq!(config.learning_period_secs(), 30 * 60);
        assert!(config.require_sasl);
        assert_eq!(config.reject_message, "User unknown in local recipient table");
    }

    #[test]
    fn test_config_kebab_case_keys() {
        let yaml = "\
host: 0.0.0.0
port: 12525
max-connections: 4
learning-period: 5
require-sasl: false
reject-message: go away
smtp-host: relay.dent.tld
smtp-port: 587
config-dir: /tmp/postwhite
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.learning_period, 5);
        assert!(!config.require_sasl);
        assert_eq!(config.reject_message, "go away");
        assert_eq!(config.smtp_port, 587);
        // Unset options keep their defaults.
        assert_eq!(config.pid_file, "/var/run/postwhite.pid");
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.host, config.host);
        assert_eq!(parsed.max_connections, config.max_connections);
    }

    #[test]
    fn test_registry_membership_and_sasl() {
        let yaml = "\
hitchhike@dent.tld: hitchhike
Marvin@Sirius.TLD: ~
";
        let raw: HashMap<String, Option<String>> = serde_yaml::from_str(yaml).unwrap();
        let registry = Registry::from_map(raw);

        assert!(registry.contains("hitchhike@dent.tld"));
        assert!(registry.contains("marvin@sirius.tld"));
        assert!(!registry.contains("trillian@heart.tld"));

        assert_eq!(registry.expected_sasl("hitchhike@dent.tld"), Some("hitchhike"));
        assert_eq!(registry.expected_sasl("marvin@sirius.tld"), None);
    }
}
