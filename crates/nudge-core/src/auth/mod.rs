//! Authentication module for managing the token session.
//!
//! This module provides:
//! - `CredentialStore`: the persisted access/refresh token pair
//! - `SessionContext`: login, logout, and the startup identity check
//!
//! Tokens are opaque strings minted by the backend; the client never
//! inspects them and refreshes purely in reaction to 401 responses.

pub mod credentials;
pub mod session;

pub use credentials::CredentialStore;
pub use session::{SessionContext, SessionState};
