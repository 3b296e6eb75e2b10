pub mod commands;
pub mod session;

pub use commands::SmtpCommand;
pub use session::SmtpSession;
