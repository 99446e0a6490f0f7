//! REST API gateway module for the nudge backend.
//!
//! This module provides the `Gateway` for making authenticated API
//! requests. The backend uses JWT bearer token authentication; the
//! gateway attaches the stored access token to every call, collapses
//! concurrent token refreshes into a single request, and retries a
//! 401 response exactly once after a successful refresh.

pub mod error;
pub mod gateway;

pub use error::ApiError;
pub use gateway::{Gateway, SessionEvent};
