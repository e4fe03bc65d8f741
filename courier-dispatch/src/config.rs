//! Dispatch configuration, loaded from RON

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable pointing at the configuration file
pub const CONFIG_VAR: &str = "COURIER_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

const fn default_port() -> u16 {
    25
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_max_recipients() -> usize {
    50
}

fn default_message_id_suffix() -> String {
    "email-dispatch".to_string()
}

const fn default_process_interval() -> u64 {
    10
}

fn default_max_concurrent_reports() -> usize {
    num_cpus::get()
}

const fn default_resolve_timeout() -> u64 {
    30
}

/// Where the transport connects. The engine itself never reads this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Name announced in the greeting
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            name: String::new(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Maximum addresses per dispatch handler
    ///
    /// Larger (class, locale) buckets are split across several handlers.
    ///
    /// Default: 50
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Deliver every recipient as Bcc, regardless of the sender's own flag
    ///
    /// Default: `false`
    #[serde(default)]
    pub recipients_as_bccs: bool,

    /// Right-hand side of generated `Message-ID` headers
    #[serde(default = "default_message_id_suffix")]
    pub message_id_suffix: String,

    /// How often pending reports get a delivery pass (in seconds)
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,

    /// Reports attempted in parallel during one pass
    ///
    /// Default: number of CPUs
    #[serde(default = "default_max_concurrent_reports")]
    pub max_concurrent_reports: usize,

    /// Timeout around each group expansion (in seconds)
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Blacklist entries older than this are pruned by the serve loop
    ///
    /// Default: None (keep the whole log)
    #[serde(default)]
    pub blacklist_retention_secs: Option<u64>,

    /// Drop suppressed addresses during resolution
    ///
    /// Addresses with any invalid entry, or with more than this many failed
    /// entries, are skipped silently. With `None` the blacklist is only
    /// recorded, never consulted.
    #[serde(default)]
    pub failure_threshold: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            smtp: SmtpConfig::default(),
            max_recipients: default_max_recipients(),
            recipients_as_bccs: false,
            message_id_suffix: default_message_id_suffix(),
            process_interval_secs: default_process_interval(),
            max_concurrent_reports: default_max_concurrent_reports(),
            resolve_timeout_secs: default_resolve_timeout(),
            blacklist_retention_secs: None,
            failure_threshold: None,
        }
    }
}

impl DispatchConfig {
    /// Parse and validate a RON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_ron_str(&content)
    }

    /// Load the configuration using the following precedence:
    /// 1. `COURIER_CONFIG` environment variable
    /// 2. ./courier.config.ron (current working directory)
    /// 3. /etc/courier/courier.config.ron (system-wide config)
    ///
    /// # Errors
    ///
    /// Returns an error if no file is found or the file found is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_file(&find_config_file(std::env::var(CONFIG_VAR).ok())?)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recipients == 0 {
            return Err(ConfigError::Invalid {
                field: "max_recipients",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.max_concurrent_reports == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_reports",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.process_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "process_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub const fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs)
    }

    #[must_use]
    pub const fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    #[must_use]
    pub fn blacklist_retention(&self) -> Option<chrono::Duration> {
        self.blacklist_retention_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

fn find_config_file(env_path: Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::NotFound(format!(
            "{CONFIG_VAR} points to non-existent file: {}",
            path.display()
        )));
    }

    DEFAULT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| {
            ConfigError::NotFound(
                DEFAULT_PATHS
                    .iter()
                    .map(|path| format!("  - {path}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DispatchConfig::from_ron_str("()").unwrap();

        assert_eq!(config.max_recipients, 50);
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.message_id_suffix, "email-dispatch");
        assert_eq!(config.process_interval(), Duration::from_secs(10));
        assert_eq!(config.resolve_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent_reports, num_cpus::get());
        assert!(!config.recipients_as_bccs);
        assert_eq!(config.failure_threshold, None);
        assert_eq!(config.blacklist_retention(), None);
    }

    #[test]
    fn test_full_document() {
        let config = DispatchConfig::from_ron_str(
            r#"(
                smtp: (host: "mail.example.com", name: "courier", port: 587),
                max_recipients: 10,
                recipients_as_bccs: true,
                process_interval_secs: 5,
                max_concurrent_reports: 4,
                resolve_timeout_secs: 2,
                blacklist_retention_secs: Some(86400),
                failure_threshold: Some(3),
            )"#,
        )
        .unwrap();

        assert_eq!(
            config.smtp,
            SmtpConfig {
                host: "mail.example.com".to_string(),
                name: "courier".to_string(),
                port: 587,
            }
        );
        assert_eq!(config.max_recipients, 10);
        assert!(config.recipients_as_bccs);
        assert_eq!(config.max_concurrent_reports, 4);
        assert_eq!(config.failure_threshold, Some(3));
        assert_eq!(config.blacklist_retention(), Some(chrono::Duration::days(1)));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let err = DispatchConfig::from_ron_str("(max_recipients: 0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_recipients", .. }));

        let err = DispatchConfig::from_ron_str("(max_concurrent_reports: 0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_concurrent_reports", .. }));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            DispatchConfig::from_ron_str("(max_recipients: \"lots\")"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_and_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "(max_recipients: 7)").unwrap();

        let found = find_config_file(Some(file.path().display().to_string())).unwrap();
        assert_eq!(found, file.path());
        assert_eq!(DispatchConfig::from_file(&found).unwrap().max_recipients, 7);

        assert!(matches!(
            find_config_file(Some("/nonexistent/courier.config.ron".to_string())),
            Err(ConfigError::NotFound(_))
        ));
        assert!(matches!(
            DispatchConfig::from_file(Path::new("/nonexistent/courier.config.ron")),
            Err(ConfigError::Read { .. })
        ));
    }
}
