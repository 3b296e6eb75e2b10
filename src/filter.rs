//! Message filter contract
//!
//! The SMTP engine passes each accepted message body through an optional
//! filter before enqueueing it. The call is synchronous from the engine's
//! perspective and happens at most once per message; a filter failure is a
//! temporary condition (the session replies 451 and continues).

use crate::error::{MailError, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// A message-body transformer, e.g. a spam scanner that annotates headers.
pub trait MessageFilter: Send + Sync {
    /// Return the (possibly rewritten) body to enqueue in place of `body`.
    fn filter(&self, body: &[u8]) -> Result<Vec<u8>>;
}

/// Pipes the body through an external command's stdin and takes its stdout
/// as the replacement body. The command is expected to consume all input
/// before producing output, as spamc does.
pub struct SpamcFilter {
    command: String,
}

impl SpamcFilter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl MessageFilter for SpamcFilter {
    fn filter(&self, body: &[u8]) -> Result<Vec<u8>> {
        debug!("piping {} byte message through {}", body.len(), self.command);
        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| MailError::Filter(format!("cannot start {}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MailError::Filter("filter stdin unavailable".to_string()))?;
        stdin
            .write_all(body)
            .map_err(|e| MailError::Filter(format!("write to filter failed: {}", e)))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .map_err(|e| MailError::Filter(format!("filter did not finish: {}", e)))?;
        if !output.status.success() {
            return Err(MailError::Filter(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cat_is_identity() {
        let filter = SpamcFilter::new("cat");
        let body = b"Subject: hi\n\nhello\n";
        assert_eq!(filter.filter(body).unwrap(), body.to_vec());
    }

    #[test]
    fn test_missing_command_is_filter_error() {
        let filter = SpamcFilter::new("/nonexistent/filter-binary");
        assert!(matches!(
            filter.filter(b"x"),
            Err(MailError::Filter(_))
        ));
    }
}
