//! Domain and user registry
//!
//! Maps domain and user names onto a filesystem namespace:
//! `<root>/<domain>/users/<user>/Maildir`. Lookups distinguish a missing
//! domain, a missing user and a missing mailbox so the SMTP engine can
//! reply with a permanent or a temporary failure as appropriate.

use crate::error::{MailError, Result};
use crate::storage::Maildir;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Validate a domain name for filesystem use: every dot-separated label
/// must be non-empty and consist of `[A-Za-z0-9_-]` only.
pub fn validate_domain_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MailError::InvalidAddress("empty domain name".to_string()));
    }
    for label in name.split('.') {
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(MailError::InvalidAddress(format!(
                "illegal domain name: {}",
                name
            )));
        }
    }
    Ok(())
}

/// User names become directory names; reject anything that could escape
/// the users directory.
fn validate_user_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(MailError::InvalidAddress(format!(
            "illegal user name: {}",
            name
        )));
    }
    Ok(())
}

/// The registry of locally hosted domains, rooted at a configured
/// directory.
pub struct DomainRegistry {
    root: PathBuf,
}

impl DomainRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Look up a hosted domain. `DomainNotFound` when the domain directory
    /// does not exist.
    pub async fn get_domain(&self, name: &str) -> Result<Domain> {
        validate_domain_name(name)?;
        let path = self.root.join(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(Domain {
                name: name.to_string(),
                path,
            }),
            _ => Err(MailError::DomainNotFound(name.to_string())),
        }
    }

    /// Provision a domain directory, returning the handle. Already-existing
    /// domains are returned as-is.
    pub async fn create_domain(&self, name: &str) -> Result<Domain> {
        validate_domain_name(name)?;
        let path = self.root.join(name);
        fs::create_dir_all(path.join("users")).await?;
        Ok(Domain {
            name: name.to_string(),
            path,
        })
    }
}

/// A locally hosted domain.
pub struct Domain {
    name: String,
    path: PathBuf,
}

impl Domain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a user of this domain. `UserNotFound` when the user
    /// directory does not exist.
    pub async fn get_user(&self, name: &str) -> Result<User> {
        validate_user_name(name)?;
        let path = self.path.join("users").join(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(User {
                name: name.to_string(),
                path,
            }),
            _ => Err(MailError::UserNotFound(format!("{}@{}", name, self.name))),
        }
    }

    /// Open a user's mailbox. A missing user is a permanent condition; a
    /// user whose Maildir is missing or malformed is a temporary one, and
    /// the two come back as distinct errors.
    pub async fn user_maildir(&self, name: &str) -> Result<Maildir> {
        let user = self.get_user(name).await?;
        match Maildir::open(user.maildir_path()).await {
            Ok(maildir) => Ok(maildir),
            Err(e) => {
                warn!("user {} exists but maildir is unusable: {}", name, e);
                Err(MailError::MaildirNotFound(format!(
                    "{}@{}",
                    name, self.name
                )))
            }
        }
    }

    /// Provision a user directory with a fresh Maildir.
    pub async fn create_user(&self, name: &str) -> Result<User> {
        validate_user_name(name)?;
        let path = self.path.join("users").join(name);
        fs::create_dir_all(&path).await?;
        let user = User {
            name: name.to_string(),
            path,
        };
        Maildir::create(user.maildir_path()).await?;
        Ok(user)
    }
}

/// A user of a hosted domain.
pub struct User {
    name: String,
    path: PathBuf,
}

impl User {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn maildir_path(&self) -> PathBuf {
        self.path.join("Maildir")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domain_names() {
        assert!(validate_domain_name("example.com").is_ok());
        assert!(validate_domain_name("mail-1.example_2.org").is_ok());
        assert!(validate_domain_name("localhost").is_ok());
    }

    #[test]
    fn test_invalid_domain_names() {
        assert!(validate_domain_name("").is_err());
        assert!(validate_domain_name("ex ample.com").is_err());
        assert!(validate_domain_name("..").is_err());
        assert!(validate_domain_name("a/b").is_err());
        assert!(validate_domain_name(".example").is_err());
        assert!(validate_domain_name("example.").is_err());
    }

    #[test]
    fn test_invalid_user_names() {
        assert!(validate_user_name("").is_err());
        assert!(validate_user_name("../alice").is_err());
        assert!(validate_user_name("a/b").is_err());
        assert!(validate_user_name("a\\b").is_err());
        assert!(validate_user_name("alice").is_ok());
    }
}
