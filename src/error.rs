use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("POP3 protocol error: {0}")]
    Pop3Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Maildir not found: {0}")]
    MaildirNotFound(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Idle timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MailError>;
