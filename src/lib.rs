//! postbox-rs: a small mail server core
//!
//! An SMTP submission engine that accepts mail into a durable on-disk
//! queue, a POP3 engine that serves mail back out of Maildir mailboxes,
//! and the storage layer both share.
//!
//! # Architecture
//!
//! Sessions are spawned one-per-connection by an external super-server and
//! speak on stdin/stdout; the peer's TCP endpoints arrive in environment
//! variables. The engines themselves are generic over any async read/write
//! pair, which is also how the tests drive them in-process.
//!
//! - **SMTP**: EHLO with 8BITMIME/PIPELINING/SIZE/AUTH CRAM-MD5, recipient
//!   validation against locally hosted domains, relay only for
//!   authenticated senders, dot-stuffed DATA with a prepended `Received:`
//!   trace, queue handoff.
//! - **POP3**: authorization/transaction/update state machine over a
//!   Maildir maildrop; deletions commit in UPDATE.
//! - **Storage**: Maildir mailboxes with rename-atomic publication and an
//!   envelope+message file queue with the same unique-name scheme.
//!
//! # Modules
//!
//! - [`address`]: `user[-folder][@domain]` parsing
//! - [`config`]: TOML configuration
//! - [`connection`]: line-oriented session transport
//! - [`domain`]: domain/user registry over the filesystem
//! - [`error`]: error types and handling
//! - [`filter`]: pluggable message filter (spam scanning)
//! - [`pop3`]: POP3 session engine
//! - [`security`]: CRAM-MD5 and the credential oracle
//! - [`smtp`]: SMTP session engine
//! - [`storage`]: Maildir and the message queue

pub mod address;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod filter;
pub mod pop3;
pub mod security;
pub mod smtp;
pub mod storage;

pub use config::Config;
pub use error::{MailError, Result};
