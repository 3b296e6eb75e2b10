//! POP3 retrieval session engine
//!
//! The classic three-state machine: AUTHORIZATION until USER/PASS succeed,
//! TRANSACTION for mailbox access, UPDATE on QUIT to commit deletions.
//! DELE only marks; nothing is removed from the Maildir until UPDATE, and a
//! QUIT from AUTHORIZATION skips UPDATE entirely.

use crate::address::Address;
use crate::config::Config;
use crate::connection::Connection;
use crate::domain::DomainRegistry;
use crate::error::{MailError, Result};
use crate::security::auth::secrets_equal;
use crate::security::CredentialStore;
use crate::storage::Maildir;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authorization,
    Transaction,
    Update,
}

struct MessageEntry {
    id: String,
    size: u64,
}

/// A POP3 session over any line transport.
pub struct Pop3Session<R, W> {
    conn: Connection<R, W>,
    server_name: String,
    registry: DomainRegistry,
    credentials: Option<Box<dyn CredentialStore>>,

    state: SessionState,
    user: Option<String>,
    maildir: Option<Maildir>,
    /// Snapshot of the maildrop taken when the session authenticated.
    /// POP3 message numbers are 1-based indexes into this list.
    messages: Vec<MessageEntry>,
    deleted: Vec<bool>,
}

impl<R, W> Pop3Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(conn: Connection<R, W>, config: &Config, registry: DomainRegistry) -> Self {
        let mut conn = conn;
        conn.set_idle_timeout(std::time::Duration::from_secs(
            config.pop3.idle_timeout_secs,
        ));
        Self {
            conn,
            server_name: config.server.hostname.clone(),
            registry,
            credentials: None,
            state: SessionState::Authorization,
            user: None,
            maildir: None,
            messages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Box<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Send the opening banner.
    pub async fn greet(&mut self) -> Result<()> {
        self.conn
            .write_line(&format!("+OK {} POP3 server ready", self.server_name))
            .await
    }

    /// Drive the session until QUIT, end of stream or idle timeout.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let line = match self.conn.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client closed the stream");
                    break;
                }
                Err(MailError::Timeout) => {
                    warn!("session idle timeout");
                    break;
                }
                Err(e) => return Err(e),
            };
            debug!("C: {}", line);

            let terminate = match self.handle_line(&line).await {
                Ok(terminate) => terminate,
                Err(MailError::Timeout) => {
                    warn!("session idle timeout");
                    break;
                }
                Err(e) => return Err(e),
            };
            if terminate {
                break;
            }
        }
        self.conn.close().await
    }

    async fn handle_line(&mut self, line: &str) -> Result<bool> {
        let trimmed = line.trim();
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg.trim())),
            None => (trimmed, None),
        };
        let verb = verb.to_uppercase();

        match self.state {
            SessionState::Authorization => match verb.as_str() {
                "USER" => self.process_user(arg).await.map(|_| false),
                "PASS" => self.process_pass(arg).await.map(|_| false),
                "QUIT" => {
                    // No UPDATE from AUTHORIZATION: nothing is committed.
                    self.ok("goodbye").await?;
                    Ok(true)
                }
                _ => self.err("Unrecognized command").await.map(|_| false),
            },
            SessionState::Transaction => match verb.as_str() {
                "STAT" => self.process_stat().await.map(|_| false),
                "LIST" => self.process_list(arg).await.map(|_| false),
                "RETR" => self.process_retr(arg).await.map(|_| false),
                "DELE" => self.process_dele(arg).await.map(|_| false),
                "NOOP" => self.ok("").await.map(|_| false),
                "QUIT" => {
                    self.state = SessionState::Update;
                    self.commit_deletions().await?;
                    self.ok("goodbye").await?;
                    Ok(true)
                }
                _ => self.err("Unrecognized command").await.map(|_| false),
            },
            SessionState::Update => Ok(true),
        }
    }

    async fn process_user(&mut self, arg: Option<&str>) -> Result<()> {
        match arg {
            Some(name) if !name.is_empty() => {
                self.user = Some(name.to_string());
                self.ok("send PASS").await
            }
            _ => self.err("USER requires a mailbox name").await,
        }
    }

    async fn process_pass(&mut self, arg: Option<&str>) -> Result<()> {
        let Some(pass) = arg else {
            return self.err("PASS requires a password").await;
        };
        let Some(user) = self.user.clone() else {
            return self.err("send USER first").await;
        };

        let authenticated = match &self.credentials {
            Some(store) => match store.secret(&user) {
                Ok(secret) => secrets_equal(&secret, pass.as_bytes()),
                Err(_) => false,
            },
            None => false,
        };
        if !authenticated {
            warn!("authentication failed for {}", user);
            return self.err("Authentication failed").await;
        }

        let addr = Address::parse(&user);
        let maildir = match self.open_maildrop(&addr).await {
            Ok(maildir) => maildir,
            Err(e) => {
                warn!("no maildrop for {}: {}", user, e);
                return self.err("Mailbox not available").await;
            }
        };

        let ids = maildir.list().await?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let size = maildir.size(&id).await?;
            messages.push(MessageEntry { id, size });
        }
        info!("{} opened maildrop with {} message(s)", user, messages.len());

        self.deleted = vec![false; messages.len()];
        self.messages = messages;
        self.maildir = Some(maildir);
        self.state = SessionState::Transaction;
        self.ok("maildrop locked and ready").await
    }

    async fn open_maildrop(&self, addr: &Address) -> Result<Maildir> {
        let domain = self.registry.get_domain(addr.domain()).await?;
        domain.user_maildir(addr.user()).await
    }

    async fn process_stat(&mut self) -> Result<()> {
        let (count, octets) = self.remaining();
        let text = format!("{} {}", count, octets);
        self.ok(&text).await
    }

    async fn process_list(&mut self, arg: Option<&str>) -> Result<()> {
        if let Some(arg) = arg {
            return match self.resolve_index(arg) {
                Some(index) => {
                    let text = format!("{} {}", index + 1, self.messages[index].size);
                    self.ok(&text).await
                }
                None => self.err("No such message").await,
            };
        }
        let (count, octets) = self.remaining();
        let text = format!("{} messages ({} octets)", count, octets);
        self.ok(&text).await?;
        for index in 0..self.messages.len() {
            if self.deleted[index] {
                continue;
            }
            let line = format!("{} {}", index + 1, self.messages[index].size);
            self.conn.write_line(&line).await?;
        }
        self.conn.write_line(".").await
    }

    async fn process_retr(&mut self, arg: Option<&str>) -> Result<()> {
        let Some(index) = arg.and_then(|a| self.resolve_index(a)) else {
            return self.err("No such message").await;
        };
        let Some(maildir) = &self.maildir else {
            return self.err("No such message").await;
        };
        let msg = match maildir.read(&self.messages[index].id).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!("message {} unreadable: {}", self.messages[index].id, e);
                return self.err("No such message").await;
            }
        };
        let text = format!("{} octets", self.messages[index].size);
        self.ok(&text).await?;
        for line in String::from_utf8_lossy(&msg).lines() {
            // Byte-stuff lines that would look like the terminator.
            if line.starts_with('.') {
                self.conn.write_line(&format!(".{}", line)).await?;
            } else {
                self.conn.write_line(line).await?;
            }
        }
        self.conn.write_line(".").await
    }

    async fn process_dele(&mut self, arg: Option<&str>) -> Result<()> {
        let Some(index) = arg.and_then(|a| self.resolve_index(a)) else {
            return self.err("No such message").await;
        };
        self.deleted[index] = true;
        let text = format!("message {} deleted", index + 1);
        self.ok(&text).await
    }

    /// UPDATE: remove every message marked for deletion.
    async fn commit_deletions(&mut self) -> Result<()> {
        let Some(maildir) = &self.maildir else {
            return Ok(());
        };
        for (index, entry) in self.messages.iter().enumerate() {
            if self.deleted[index] {
                info!("deleting message {}", entry.id);
                maildir.delete(&entry.id).await?;
            }
        }
        Ok(())
    }

    /// Count and total size of messages not marked for deletion.
    fn remaining(&self) -> (usize, u64) {
        let mut count = 0;
        let mut octets = 0;
        for (index, entry) in self.messages.iter().enumerate() {
            if !self.deleted[index] {
                count += 1;
                octets += entry.size;
            }
        }
        (count, octets)
    }

    /// A valid, not-deleted 1-based message number, as a 0-based index.
    fn resolve_index(&self, arg: &str) -> Option<usize> {
        let number: usize = arg.trim().parse().ok()?;
        if number == 0 || number > self.messages.len() || self.deleted[number - 1] {
            return None;
        }
        Some(number - 1)
    }

    async fn ok(&mut self, text: &str) -> Result<()> {
        let line = if text.is_empty() {
            "+OK".to_string()
        } else {
            format!("+OK {}", text)
        };
        debug!("S: {}", line);
        self.conn.write_line(&line).await
    }

    async fn err(&mut self, text: &str) -> Result<()> {
        debug!("S: -ERR {}", text);
        self.conn.write_line(&format!("-ERR {}", text)).await
    }
}
