pub mod auth;
pub mod credentials;

pub use credentials::{CredentialStore, FileCredentialStore};
