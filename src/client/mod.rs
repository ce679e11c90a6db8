pub mod config;
pub mod session;

pub use config::ClientConfig;
pub use session::{AccountError, LoginError, Role, SessionInfo, SessionManager};
