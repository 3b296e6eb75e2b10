pub mod session;

pub use session::{Pop3Session, SessionState};
