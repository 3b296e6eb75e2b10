//! SMTP command parsing
//!
//! One line becomes one [`SmtpCommand`]: the verb is split at the first
//! space and uppercased; argument handling is left to the session, which
//! knows which reply code each failure deserves. Address extraction and the
//! suspicious-input guard live here so both MAIL and RCPT share them.

use crate::error::{MailError, Result};

/// SMTP verbs understood by the submission engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// AUTH with the requested mechanism (and any trailing argument).
    Auth(String),
    /// MAIL with its raw argument text.
    Mail(String),
    /// RCPT with its raw argument text.
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    Unknown(String),
}

impl SmtpCommand {
    /// Parse a command line. Total: anything unrecognized becomes
    /// `Unknown`.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let (verb, args) = match trimmed.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (trimmed, ""),
        };
        match verb.to_uppercase().as_str() {
            "HELO" => SmtpCommand::Helo(args.to_string()),
            "EHLO" => SmtpCommand::Ehlo(args.to_string()),
            "AUTH" => SmtpCommand::Auth(args.to_string()),
            "MAIL" => SmtpCommand::Mail(args.to_string()),
            "RCPT" => SmtpCommand::Rcpt(args.to_string()),
            "DATA" => SmtpCommand::Data,
            "RSET" => SmtpCommand::Rset,
            "NOOP" => SmtpCommand::Noop,
            "VRFY" => SmtpCommand::Vrfy,
            "QUIT" => SmtpCommand::Quit,
            other => SmtpCommand::Unknown(other.to_string()),
        }
    }
}

/// Pull the angle-bracketed address out of a MAIL or RCPT argument. The
/// result may be empty (`<>`), which the session treats per-verb. Addresses
/// over 254 octets are rejected (RFC 5321 section 4.5.3.1).
pub fn extract_address(args: &str) -> Result<String> {
    let begin = args.find('<');
    let end = args.rfind('>');
    match (begin, end) {
        (Some(b), Some(e)) if b < e => {
            let value = &args[b + 1..e];
            if value.len() > 254 {
                return Err(MailError::InvalidAddress(
                    "address exceeds maximum length".to_string(),
                ));
            }
            Ok(value.to_string())
        }
        _ => Err(MailError::InvalidAddress(
            "address not found in command".to_string(),
        )),
    }
}

/// Addresses end up in filesystem lookups; refuse anything that smells
/// like a path.
pub fn is_suspicious_address(input: &str) -> bool {
    input.contains("..") || input.contains('/') || input.contains('\\')
}
