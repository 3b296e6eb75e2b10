use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub hostname: String,
    pub banner: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Maximum message size in bytes; 0 disables the limit and the SIZE
    /// capability.
    pub max_message_size: usize,
    pub recipient_limit: usize,
    /// External spam filter command; the message body is piped through its
    /// stdin/stdout when set.
    pub spamc: Option<String>,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pop3Config {
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// TOML file mapping user names to shared secrets. Authentication is
    /// refused when unset.
    pub secrets_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub domain_root: String,
    pub queue_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::MailError::Config(e.to_string()))?;

        toml::from_str(&content)
            .map_err(|e| crate::error::MailError::Config(e.to_string()))
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                hostname: "mail.localhost".to_string(),
                banner: "ESMTP Service Ready".to_string(),
            },
            smtp: SmtpConfig {
                max_message_size: 10 * 1024 * 1024, // 10MB
                recipient_limit: 100,
                spamc: None,
                idle_timeout_secs: 300,
            },
            pop3: Pop3Config {
                idle_timeout_secs: 300,
            },
            auth: AuthConfig { secrets_path: None },
            storage: StorageConfig {
                domain_root: "/srv/domains".to_string(),
                queue_path: "/srv/queue".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
