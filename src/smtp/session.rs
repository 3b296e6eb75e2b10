//! SMTP submission session engine
//!
//! One session per connection. The engine owns the per-session state
//! (greeting, authenticated sender, envelope under construction) and drives
//! the command dispatch loop: read a line, produce a `(code, text,
//! terminate)` reply, write it, stop when told to. EHLO, AUTH and DATA do
//! additional I/O of their own before the final reply.
//!
//! Accepted messages are handed to the queue with a prepended `Received:`
//! trace header; per-message state then resets so a pipelined client can
//! run the next transaction on the same session.

use crate::address::Address;
use crate::config::Config;
use crate::connection::Connection;
use crate::domain::DomainRegistry;
use crate::error::{MailError, Result};
use crate::filter::MessageFilter;
use crate::security::auth;
use crate::security::CredentialStore;
use crate::smtp::commands::{extract_address, is_suspicious_address, SmtpCommand};
use crate::storage::Queue;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// The outcome of one dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
    pub terminate: bool,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            terminate: false,
        }
    }

    fn terminal(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            terminate: true,
        }
    }
}

/// An SMTP submission session over any line transport.
pub struct SmtpSession<R, W> {
    conn: Connection<R, W>,
    server_name: String,
    banner: String,
    max_message_size: usize,
    recipient_limit: usize,
    registry: DomainRegistry,
    queue: Queue,
    filter: Option<Box<dyn MessageFilter>>,
    credentials: Option<Box<dyn CredentialStore>>,

    greeted: bool,
    /// Authenticated submitter; set only by a successful AUTH.
    sender: Option<String>,
    /// Claimed MAIL FROM address of the transaction in progress.
    from: Option<String>,
    recipients: Vec<String>,
    /// Trace headers this server prepends to the message.
    headers: Vec<String>,
    data: Vec<u8>,
}

impl<R, W> SmtpSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        conn: Connection<R, W>,
        config: &Config,
        registry: DomainRegistry,
        queue: Queue,
    ) -> Self {
        let mut conn = conn;
        conn.set_idle_timeout(std::time::Duration::from_secs(
            config.smtp.idle_timeout_secs,
        ));
        Self {
            conn,
            server_name: config.server.hostname.clone(),
            banner: config.server.banner.clone(),
            max_message_size: config.smtp.max_message_size,
            recipient_limit: config.smtp.recipient_limit,
            registry,
            queue,
            filter: None,
            credentials: None,
            greeted: false,
            sender: None,
            from: None,
            recipients: Vec::new(),
            headers: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn MessageFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_credentials(mut self, credentials: Box<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Send the opening banner.
    pub async fn greet(&mut self) -> Result<()> {
        self.write_code(220, &format!("{} {}", self.server_name, self.banner))
            .await
    }

    /// Drive the session until QUIT, end of stream, idle timeout or a
    /// transport failure.
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

            let reply = match self.handle_line(&line).await {
                Ok(reply) => reply,
                Err(MailError::Timeout) => {
                    warn!("session idle timeout");
                    break;
                }
                Err(e) => return Err(e),
            };
            self.write_code(reply.code, &reply.text).await?;
            if reply.terminate {
                break;
            }
        }
        self.conn.close().await
    }

    async fn handle_line(&mut self, line: &str) -> Result<Reply> {
        match SmtpCommand::parse(line) {
            SmtpCommand::Helo(name) => Ok(self.process_helo(&name)),
            SmtpCommand::Ehlo(name) => self.process_ehlo(&name).await,
            SmtpCommand::Auth(mechanism) => self.process_auth(&mechanism).await,
            SmtpCommand::Mail(args) => Ok(self.process_mail(&args)),
            SmtpCommand::Rcpt(args) => self.process_rcpt(&args).await,
            SmtpCommand::Data => self.process_data().await,
            SmtpCommand::Rset => {
                self.reset_transaction();
                Ok(Reply::new(250, "OK"))
            }
            SmtpCommand::Noop => Ok(Reply::new(250, "OK")),
            SmtpCommand::Vrfy => Ok(Reply::new(500, "VRFY not supported")),
            SmtpCommand::Quit => Ok(Reply::terminal(221, "goodbye")),
            SmtpCommand::Unknown(verb) => {
                debug!("unrecognized command: {}", verb);
                Ok(Reply::new(500, "Unrecognized command"))
            }
        }
    }

    fn process_helo(&mut self, name: &str) -> Reply {
        if !self.greeted {
            info!("client greeted as {}", name);
        }
        self.greeted = true;
        Reply::new(250, self.server_name.clone())
    }

    async fn process_ehlo(&mut self, name: &str) -> Result<Reply> {
        if !self.greeted {
            info!("client greeted as {}", name);
        }
        self.greeted = true;
        self.conn.write_line("250-8BITMIME").await?;
        self.conn.write_line("250-PIPELINING").await?;
        self.conn.write_line("250-AUTH CRAM-MD5").await?;
        if self.max_message_size > 0 {
            self.conn
                .write_line(&format!("250-SIZE {}", self.max_message_size))
                .await?;
        }
        Ok(Reply::new(250, self.server_name.clone()))
    }

    async fn process_auth(&mut self, mechanism: &str) -> Result<Reply> {
        if mechanism != "CRAM-MD5" {
            debug!("rejecting AUTH mechanism {:?}", mechanism);
            return Ok(Reply::new(500, "Unrecognized command"));
        }

        let challenge = auth::create_challenge(&self.server_name);
        self.write_code(354, &auth::encode_challenge(&challenge))
            .await?;
        let response = match self.conn.read_line().await? {
            Some(line) => line,
            None => return Ok(Reply::new(550, "Authentication failed")),
        };
        let (user, digest) = match auth::decode_response(&response) {
            Ok(parts) => parts,
            Err(_) => return Ok(Reply::new(550, "Authentication failed")),
        };
        let Some(store) = &self.credentials else {
            warn!("AUTH attempted but no credential store is configured");
            return Ok(Reply::new(550, "Authentication failed"));
        };
        let secret = match store.secret(&user) {
            Ok(secret) => secret,
            Err(_) => {
                warn!("authentication failed for unknown user {}", user);
                return Ok(Reply::new(550, "Authentication failed"));
            }
        };
        match auth::verify_cram_md5(&challenge, &secret, &digest) {
            Ok(true) => {
                info!("authenticated sender {}", user);
                self.sender = Some(user);
                Ok(Reply::new(235, "Authentication successful"))
            }
            Ok(false) => {
                warn!("authentication failed for {}", user);
                Ok(Reply::new(550, "Authentication failed"))
            }
            Err(e) => {
                error!("CRAM-MD5 verification error: {}", e);
                Ok(Reply::new(550, "Authentication failed"))
            }
        }
    }

    fn process_mail(&mut self, args: &str) -> Reply {
        if self.from.is_some() {
            return Reply::new(400, "MAIL FROM already sent");
        }
        let addr = match extract_address(args) {
            Ok(addr) => addr,
            Err(_) => return Reply::new(451, "Invalid address"),
        };
        if addr.is_empty() {
            return Reply::new(551, "We don't accept mail to that address");
        }
        info!("MAIL FROM {}", addr);
        self.from = Some(addr);
        Reply::new(250, "OK")
    }

    async fn process_rcpt(&mut self, args: &str) -> Result<Reply> {
        let addr = match extract_address(args) {
            Ok(addr) => addr,
            Err(_) => return Ok(Reply::new(550, "Invalid address")),
        };
        if self.from.is_none() {
            return Ok(Reply::new(503, "need MAIL before RCPT"));
        }
        if self.recipients.len() >= self.recipient_limit {
            warn!(
                "rejecting RCPT, {} recipients already",
                self.recipients.len()
            );
            return Ok(Reply::new(452, "Too many recipients"));
        }
        if addr.is_empty() {
            return Ok(Reply::new(503, "We don't accept mail to that address"));
        }
        if is_suspicious_address(&addr) {
            warn!("rejecting suspicious RCPT {}", addr);
            return Ok(Reply::new(550, "Invalid address"));
        }

        let recipient = Address::parse(&addr);
        match self.registry.get_domain(recipient.domain()).await {
            Err(MailError::DomainNotFound(_)) | Err(MailError::InvalidAddress(_)) => {
                // Foreign domain: relay only for authenticated senders.
                if self.sender.is_none() {
                    return Ok(Reply::new(551, "We don't relay mail to remote addresses"));
                }
            }
            Err(e) => {
                error!("domain lookup failed for {}: {}", recipient.domain(), e);
                return Ok(Reply::new(
                    451,
                    "Address does not exist or cannot receive mail at this time, try again later",
                ));
            }
            Ok(domain) => match domain.user_maildir(recipient.user()).await {
                Ok(_) => {}
                Err(MailError::UserNotFound(_)) => {
                    return Ok(Reply::new(550, "User does not exist"));
                }
                Err(MailError::MaildirNotFound(_)) => {
                    return Ok(Reply::new(451, "Maildir does not exist; try again later"));
                }
                Err(e) => {
                    error!("user lookup failed for {}: {}", addr, e);
                    return Ok(Reply::new(
                        451,
                        "Address does not exist or cannot receive mail at this time, try again later",
                    ));
                }
            },
        }

        let canonical = recipient.to_string();
        if !self.recipients.contains(&canonical) {
            self.recipients.push(canonical);
        }
        info!("recipient accepted: {}", addr);
        Ok(Reply::new(250, "OK"))
    }

    async fn process_data(&mut self) -> Result<Reply> {
        let Some(from) = self.from.clone() else {
            return Ok(Reply::new(503, "need MAIL before DATA"));
        };
        if self.recipients.is_empty() {
            return Ok(Reply::new(503, "need RCPT before DATA"));
        }

        let received = self.received_header();
        self.headers.push(received);

        self.write_code(354, "Send message content; end with <CRLF>.<CRLF>")
            .await?;

        let mut oversized = false;
        loop {
            let line = match self.conn.read_line().await? {
                Some(line) => line,
                None => {
                    // Stream ended mid-message; nothing was accepted.
                    self.reset_transaction();
                    return Ok(Reply::new(
                        451,
                        "message could not be accepted at this time, try again later",
                    ));
                }
            };
            if line == "." {
                break;
            }
            // Reverse dot-stuffing.
            let text = line.strip_prefix('.').unwrap_or(line.as_str());
            if oversized {
                continue;
            }
            if self.max_message_size > 0
                && self.data.len() + text.len() + 1 > self.max_message_size
            {
                warn!("message exceeds maximum size {}", self.max_message_size);
                oversized = true;
                continue;
            }
            self.data.extend_from_slice(text.as_bytes());
            self.data.push(b'\n');
        }

        if oversized {
            self.reset_transaction();
            return Ok(Reply::new(552, "Message exceeds maximum message size"));
        }

        let mut message = Vec::with_capacity(
            self.headers.iter().map(|h| h.len()).sum::<usize>() + self.data.len(),
        );
        for header in &self.headers {
            message.extend_from_slice(header.as_bytes());
        }
        message.extend_from_slice(&self.data);

        let filtered = self.filter.as_ref().map(|f| f.filter(&message));
        if let Some(result) = filtered {
            match result {
                Ok(body) => message = body,
                Err(e) => {
                    error!("message filter failed: {}", e);
                    self.reset_transaction();
                    return Ok(Reply::new(
                        451,
                        "message could not be accepted at this time, try again later",
                    ));
                }
            }
        }

        match self
            .queue
            .enqueue(self.sender.as_deref(), &from, &self.recipients, &message)
            .await
        {
            Ok(name) => {
                info!("accepted message {} from {}", name, from);
                self.reset_transaction();
                Ok(Reply::new(250, "message accepted for delivery"))
            }
            Err(e) => {
                error!("unable to enqueue message: {}", e);
                self.reset_transaction();
                Ok(Reply::new(
                    451,
                    "message could not be accepted at this time, try again later",
                ))
            }
        }
    }

    /// The trace header this server prepends to every accepted message.
    fn received_header(&self) -> String {
        let peer = self.conn.peer();
        let local = if peer.local_host.is_empty() {
            self.server_name.as_str()
        } else {
            peer.local_host.as_str()
        };
        format!(
            "Received: from {} by {} with SMTP; {}\n",
            peer.remote_ip,
            local,
            Utc::now().to_rfc2822()
        )
    }

    /// Clear per-message state; the greeting and any authenticated sender
    /// survive.
    fn reset_transaction(&mut self) {
        self.from = None;
        self.recipients.clear();
        self.headers.clear();
        self.data.clear();
    }

    async fn write_code(&mut self, code: u16, text: &str) -> Result<()> {
        debug!("S: {} {}", code, text);
        self.conn.write_line(&format!("{} {}", code, text)).await
    }
}
