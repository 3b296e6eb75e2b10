//! Credential oracle
//!
//! Challenge-response authentication needs the user's shared secret on the
//! server side. The oracle is a trait so deployments can plug in their own
//! backend; the shipped implementation reads a TOML file of
//! `user = "secret"` pairs at startup.

use crate::error::{MailError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Source of per-user shared secrets.
pub trait CredentialStore: Send + Sync {
    /// The shared secret for `user`, or `NotFound`.
    fn secret(&self, user: &str) -> Result<Vec<u8>>;
}

/// Secrets loaded from a TOML file.
pub struct FileCredentialStore {
    secrets: HashMap<String, String>,
}

impl FileCredentialStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MailError::Config(format!("cannot read secrets file: {}", e)))?;
        let secrets: HashMap<String, String> = toml::from_str(&content)
            .map_err(|e| MailError::Config(format!("cannot parse secrets file: {}", e)))?;
        Ok(Self { secrets })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            secrets: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn secret(&self, user: &str) -> Result<Vec<u8>> {
        self.secrets
            .get(user)
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| MailError::NotFound(user.to_string()))
    }
}
