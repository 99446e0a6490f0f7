//! Core client library for nudge, a mobile-first reminder and inventory
//! tracker.
//!
//! Everything the application does goes through the authenticated request
//! layer in this crate:
//!
//! - [`auth::CredentialStore`]: the persisted access/refresh token pair,
//!   the single source of truth for whether a session is active.
//! - [`api::Gateway`]: wraps every outbound API call, attaches the bearer
//!   token, and transparently recovers from access-token expiry with a
//!   single-flight refresh and one retry.
//! - [`auth::SessionContext`]: the loading/authenticated/anonymous
//!   tri-state the UI shell builds its route guard on.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
