//! Maildir storage
//!
//! Implements the Maildir mailbox format: a root directory with `tmp/`,
//! `new/` and `cur/` subdirectories. Messages are written to `tmp/` and
//! renamed into `new/` so that a reader never observes a partial message;
//! the rename must be atomic, which holds as long as the Maildir lives on a
//! single filesystem. Flags are encoded in the filename after a `:2,`
//! marker and changed by renaming within `cur/`.
//!
//! File names are generated by [`unique_name`] and are never reused. The
//! construction makes a collision within one process impossible (a global
//! atomic counter) and a cross-process collision astronomically unlikely
//! (clock, pid and 64 random bits).

use crate::error::{MailError, Result};
use chrono::{Timelike, Utc};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;

static DELIVERY_COUNT: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique message name:
/// `<secondsOfMinute>.P<pid>M<nanos>R<random>Q<counter>.<hostname>`.
pub fn unique_name() -> String {
    let now = Utc::now();
    let pid = std::process::id();
    let random: u64 = rand::random();
    let count = DELIVERY_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    format!(
        "{}.P{}M{}R{}Q{}.{}",
        now.second(),
        pid,
        now.nanosecond(),
        random,
        count,
        hostname()
    )
}

fn hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().to_string();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

/// Compose a `cur/` filename for a message id and flag set. Flags are kept
/// sorted so equal sets always produce equal names.
fn flagged_filename(id: &str, flags: &[char]) -> String {
    let base = match id.find(':') {
        Some(i) => &id[..i],
        None => id,
    };
    let mut sorted: Vec<char> = flags.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut name = String::with_capacity(base.len() + 3 + sorted.len());
    name.push_str(base);
    name.push_str(":2,");
    name.extend(sorted);
    name
}

/// The message id is the filename up to the flag marker.
fn id_from_filename(name: &str) -> &str {
    match name.find(':') {
        Some(i) => &name[..i],
        None => name,
    }
}

/// A Maildir-format mailbox rooted at a directory.
pub struct Maildir {
    dir: PathBuf,
}

impl Maildir {
    /// Create a new Maildir at `path` (mode 0755 throughout). Fails if the
    /// path already exists.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        if fs::metadata(&dir).await.is_ok() {
            return Err(MailError::Storage(format!(
                "maildir already exists: {}",
                dir.display()
            )));
        }
        for sub in [dir.clone(), dir.join("cur"), dir.join("new"), dir.join("tmp")] {
            fs::create_dir_all(&sub).await?;
            fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Self::open(&dir).await
    }

    /// Open an existing Maildir, verifying the directory layout, and fold
    /// any pending `new/` messages into `cur/`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        for sub in [dir.clone(), dir.join("cur"), dir.join("new"), dir.join("tmp")] {
            match fs::metadata(&sub).await {
                Ok(meta) if meta.is_dir() => {}
                _ => {
                    return Err(MailError::MaildirNotFound(format!(
                        "not a maildir: {}",
                        dir.display()
                    )))
                }
            }
        }
        let maildir = Self { dir };
        maildir.scan().await?;
        Ok(maildir)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Deliver a message: write to `tmp/`, then publish into `new/` with a
    /// single rename. Returns the new message id.
    pub async fn add(&self, msg: &[u8]) -> Result<String> {
        let name = unique_name();
        let tmp_path = self.dir.join("tmp").join(&name);
        let new_path = self.dir.join("new").join(&name);
        fs::write(&tmp_path, msg).await?;
        fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        fs::rename(&tmp_path, &new_path).await?;
        debug!("delivered {} byte message as {}", msg.len(), name);
        Ok(name)
    }

    /// Move every message in `new/` into `cur/` with an empty flag set.
    /// Idempotent.
    pub async fn scan(&self) -> Result<()> {
        let new_dir = self.dir.join("new");
        let cur_dir = self.dir.join("cur");
        let mut entries = fs::read_dir(&new_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            fs::rename(new_dir.join(&name), cur_dir.join(format!("{}:2,", name))).await?;
        }
        Ok(())
    }

    /// The sorted ids of every message in the mailbox.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.scan().await?;
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.dir.join("cur")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            ids.push(id_from_filename(&name).to_string());
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Read a message's bytes, looking in `new/` first and `cur/` second.
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let path = match self.find(&self.dir.join("new"), id).await {
            Ok(path) => path,
            Err(MailError::NotFound(_)) => self.find(&self.dir.join("cur"), id).await?,
            Err(e) => return Err(e),
        };
        Ok(fs::read(&path).await?)
    }

    /// Byte length of a stored message.
    pub async fn size(&self, id: &str) -> Result<u64> {
        let path = match self.find(&self.dir.join("new"), id).await {
            Ok(path) => path,
            Err(MailError::NotFound(_)) => self.find(&self.dir.join("cur"), id).await?,
            Err(e) => return Err(e),
        };
        Ok(fs::metadata(&path).await?.len())
    }

    /// The flag set of a message in `cur/`, sorted.
    pub async fn flags(&self, id: &str) -> Result<Vec<char>> {
        let path = self.find(&self.dir.join("cur"), id).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut flags: Vec<char> = match name.find(":2,") {
            Some(i) => name[i + 3..].chars().collect(),
            None => Vec::new(),
        };
        flags.sort_unstable();
        Ok(flags)
    }

    /// Replace a message's flag set by renaming within `cur/`. A concurrent
    /// rename may steal the source file; in that case the mailbox is
    /// rescanned and the rename retried once.
    pub async fn set_flags(&self, id: &str, flags: &[char]) -> Result<()> {
        match self.try_set_flags(id, flags).await {
            Err(MailError::NotFound(_)) => {
                self.scan().await?;
                self.try_set_flags(id, flags).await
            }
            result => result,
        }
    }

    async fn try_set_flags(&self, id: &str, flags: &[char]) -> Result<()> {
        let cur_dir = self.dir.join("cur");
        let old_path = self.find(&cur_dir, id).await?;
        let new_path = cur_dir.join(flagged_filename(id, flags));
        if old_path == new_path {
            return Ok(());
        }
        match fs::rename(&old_path, &new_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MailError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Set or clear a single flag.
    pub async fn set_flag(&self, id: &str, flag: char, on: bool) -> Result<()> {
        let mut flags = self.flags(id).await?;
        if on {
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        } else {
            flags.retain(|f| *f != flag);
        }
        self.set_flags(id, &flags).await
    }

    /// Remove a message. Succeeds silently when the message is absent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        for sub in ["cur", "new"] {
            if let Ok(path) = self.find(&self.dir.join(sub), id).await {
                fs::remove_file(&path).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Remove the whole mailbox.
    pub async fn remove_all(self) -> Result<()> {
        fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Locate the file in `directory` whose name starts with `id`.
    async fn find(&self, directory: &Path, id: &str) -> Result<PathBuf> {
        let mut entries = fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(id) {
                if entry.file_type().await?.is_dir() {
                    return Err(MailError::Storage(format!("{} is a directory", id)));
                }
                return Ok(directory.join(name));
            }
        }
        Err(MailError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_shape() {
        let name = unique_name();
        let pid = std::process::id();
        assert!(name.contains(&format!(".P{}M", pid)));
        assert!(name.contains('R'));
        assert!(name.contains('Q'));
        assert!(name.contains('.'));
    }

    #[test]
    fn test_unique_names_are_distinct() {
        let mut names: Vec<String> = (0..100).map(|_| unique_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 100);
    }

    #[test]
    fn test_flagged_filename_sorts_and_dedups() {
        assert_eq!(flagged_filename("m1", &['S', 'F']), "m1:2,FS");
        assert_eq!(flagged_filename("m1", &['S', 'S']), "m1:2,S");
        assert_eq!(flagged_filename("m1", &[]), "m1:2,");
    }

    #[test]
    fn test_flagged_filename_strips_existing_suffix() {
        assert_eq!(flagged_filename("m1:2,S", &['T']), "m1:2,T");
    }

    #[test]
    fn test_id_from_filename() {
        assert_eq!(id_from_filename("m1:2,ST"), "m1");
        assert_eq!(id_from_filename("m1"), "m1");
    }
}
