//! Mail storage
//!
//! - [`maildir`]: Maildir-format mailboxes with rename-atomic publication
//! - [`queue`]: the durable envelope+message queue fed by the SMTP engine

pub mod maildir;
pub mod queue;

pub use maildir::{unique_name, Maildir};
pub use queue::{DeliveryAttempt, Envelope, EnvelopeRecipient, Queue};
