pub mod client;
pub mod gateway;
pub mod security;
pub mod utils;

pub use client::{ClientConfig, Role, SessionManager};
pub use gateway::{ApiRequest, AuthFailure, Gateway, GatewayError, Outcome, Payload};
pub use security::credential_store::{CredentialStore, FileStore, StorageKey};
pub use security::token_cache::TokenCache;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
