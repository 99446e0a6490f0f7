//! Session lifecycle: startup identity confirmation, login, logout.
//!
//! The session is a tri-state, not a boolean. At startup the context is
//! `Loading` whenever an access token is stored, and route guards must not
//! redirect to login until the state has resolved to `Anonymous` - otherwise
//! every reload would flash the login screen while the identity check is
//! still in flight.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::{ApiError, Gateway};
use crate::models::{ProfileUpdate, User};

use super::CredentialStore;

/// Resolved state of the client session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// A token is stored but the identity check has not completed yet.
    Loading,
    /// The backend confirmed the stored token and returned the identity.
    Authenticated(User),
    /// No session, or the stored one could not be confirmed.
    Anonymous,
}

#[derive(Deserialize)]
struct TokenGrant {
    access: String,
    refresh: String,
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// Client session context: owns the session tri-state and the login/logout
/// operations, on top of the gateway's recovery machinery.
pub struct SessionContext {
    gateway: Gateway,
    store: Arc<CredentialStore>,
    state: Mutex<SessionState>,
}

impl SessionContext {
    /// Build a context over the given gateway and store. Starts `Loading`
    /// iff an access token is stored, so the UI can hold its chrome in
    /// place until [`confirm`](Self::confirm) resolves the state.
    pub fn new(gateway: Gateway, store: Arc<CredentialStore>) -> Self {
        let state = if store.has_session() {
            SessionState::Loading
        } else {
            SessionState::Anonymous
        };
        Self {
            gateway,
            store,
            state: Mutex::new(state),
        }
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// The confirmed identity, if authenticated.
    pub fn user(&self) -> Option<User> {
        match &*self.state.lock() {
            SessionState::Authenticated(user) => Some(user.clone()),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Loading)
    }

    /// Route-guard predicate: true only for a resolved anonymous state,
    /// never while the startup identity check is still loading.
    pub fn requires_login(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Anonymous)
    }

    /// Resolve the startup `Loading` state by confirming the stored token
    /// against the identity endpoint. No-op in any other state.
    ///
    /// An expired session is already handled inside the gateway (store
    /// cleared, expiry broadcast); any other failure is treated as
    /// transient - the state resolves to `Anonymous` but the stored tokens
    /// are kept, so the user is not logged out by a flaky connection.
    pub async fn confirm(&self) {
        if !self.is_loading() {
            return;
        }
        match self.fetch_identity().await {
            Ok(user) => {
                debug!(username = %user.username, "session confirmed");
                *self.state.lock() = SessionState::Authenticated(user);
            }
            Err(e) => {
                debug!(error = %e, "session could not be confirmed");
                *self.state.lock() = SessionState::Anonymous;
            }
        }
    }

    /// Exchange credentials for a token pair and confirm the identity.
    /// On a rejected login the store is left untouched and no partial
    /// session is established.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .gateway
            .post_public(
                "/auth/token/",
                &serde_json::json!({ "username": username, "password": password }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::InvalidCredentials.into());
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("token grant: {e}")))?;
        self.store.store(&grant.access, &grant.refresh)?;

        let user = self.fetch_identity().await?;
        *self.state.lock() = SessionState::Authenticated(user);
        Ok(())
    }

    /// Drop the session locally: clear the stored tokens and reset the
    /// state. No server call is made; the refresh token simply ages out on
    /// the backend. Safe to call when already logged out.
    pub fn logout(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear credential store on logout");
        }
        *self.state.lock() = SessionState::Anonymous;
    }

    /// Change the account password. Surfaces the backend's rejection
    /// message (wrong current password, policy violation) verbatim.
    pub async fn change_password(&self, current: &str, new: &str) -> Result<()> {
        let response = self
            .gateway
            .post(
                "/auth/change-password/",
                &serde_json::json!({ "current_password": current, "new_password": new }),
            )
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let detail = response
            .json::<ErrorDetail>()
            .await
            .map(|e| e.detail)
            .unwrap_or_else(|_| "Password change failed".to_string());
        Err(ApiError::Rejected(detail).into())
    }

    /// Update profile settings and refresh the cached identity.
    pub async fn update_profile(&self, patch: &ProfileUpdate) -> Result<User> {
        let response = self.gateway.patch("/auth/me/", patch).await?;
        if !response.status().is_success() {
            let detail = response
                .json::<ErrorDetail>()
                .await
                .map(|e| e.detail)
                .unwrap_or_else(|_| "Profile update failed".to_string());
            return Err(ApiError::Rejected(detail).into());
        }
        let user: User = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("profile: {e}")))?;

        let mut state = self.state.lock();
        if matches!(*state, SessionState::Authenticated(_)) {
            *state = SessionState::Authenticated(user.clone());
        }
        Ok(user)
    }

    async fn fetch_identity(&self) -> Result<User> {
        let response = self.gateway.get("/auth/me/").await?;
        if !response.status().is_success() {
            anyhow::bail!("identity endpoint returned {}", response.status());
        }
        response
            .json::<User>()
            .await
            .context("Failed to parse identity response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    struct NoAuthHeader;

    impl Match for NoAuthHeader {
        fn matches(&self, request: &Request) -> bool {
            !request.headers.contains_key("authorization")
        }
    }

    fn test_user_json() -> serde_json::Value {
        serde_json::json!({
            "id": 1,
            "username": "testuser",
            "email": "test@example.com",
            "timezone": "UTC",
            "daily_notification_time": "09:00:00",
            "language": "en"
        })
    }

    struct Harness {
        server: MockServer,
        _dir: tempfile::TempDir,
        store: Arc<CredentialStore>,
        session: SessionContext,
    }

    async fn harness(tokens: Option<(&str, &str)>) -> Harness {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("tokens.json")).unwrap());
        if let Some((access, refresh)) = tokens {
            store.store(access, refresh).unwrap();
        }
        let gateway = Gateway::new(server.uri(), Arc::clone(&store)).unwrap();
        let session = SessionContext::new(gateway, Arc::clone(&store));
        Harness {
            server,
            _dir: dir,
            store,
            session,
        }
    }

    #[tokio::test]
    async fn starts_anonymous_without_stored_token() {
        let h = harness(None).await;
        assert_eq!(h.session.state(), SessionState::Anonymous);
        assert!(!h.session.is_loading());
        assert!(h.session.requires_login());
    }

    #[tokio::test]
    async fn loading_gate_holds_while_unconfirmed() {
        let h = harness(Some(("tok", "ref"))).await;
        assert!(h.session.is_loading());
        assert_eq!(h.session.user(), None);
        // The route guard must not redirect yet.
        assert!(!h.session.requires_login());
    }

    #[tokio::test]
    async fn confirm_resolves_stored_session() {
        let h = harness(Some(("tok", "ref"))).await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_user_json()))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.confirm().await;
        assert!(!h.session.is_loading());
        assert_eq!(h.session.user().unwrap().username, "testuser");
        assert!(!h.session.requires_login());
    }

    #[tokio::test]
    async fn transient_confirm_failure_keeps_stored_tokens() {
        let h = harness(Some(("tok", "ref"))).await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.confirm().await;
        assert!(!h.session.is_loading());
        assert_eq!(h.session.user(), None);
        // Presumed still valid; a later call can use the old token.
        assert_eq!(h.store.access_token().as_deref(), Some("tok"));
        assert_eq!(h.store.refresh_token().as_deref(), Some("ref"));
    }

    #[tokio::test]
    async fn expired_session_is_torn_down_during_confirm() {
        let h = harness(Some(("old", "ref-1"))).await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.confirm().await;
        assert!(h.session.requires_login());
        // The gateway's recovery path cleared the store.
        assert!(!h.store.has_session());
    }

    #[tokio::test]
    async fn login_stores_tokens_and_fetches_identity() {
        let h = harness(None).await;
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .and(body_json(serde_json::json!({
                "username": "testuser", "password": "pass"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access": "fake-access", "refresh": "fake-refresh"
            })))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .and(header("authorization", "Bearer fake-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_user_json()))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.login("testuser", "pass").await.unwrap();
        assert_eq!(h.store.access_token().as_deref(), Some("fake-access"));
        assert_eq!(h.store.refresh_token().as_deref(), Some("fake-refresh"));
        assert_eq!(h.session.user().unwrap().username, "testuser");
    }

    #[tokio::test]
    async fn login_sends_no_stale_auth_header() {
        // A leftover token pair must not leak onto the token-issuance call,
        // where a 401 for a wrong password would trigger a refresh attempt.
        let h = harness(Some(("stale", "stale-ref"))).await;
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .and(NoAuthHeader)
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access": "fake-access", "refresh": "fake-refresh"
            })))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .and(header("authorization", "Bearer fake-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_user_json()))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.login("testuser", "pass").await.unwrap();
        assert_eq!(h.store.access_token().as_deref(), Some("fake-access"));
    }

    #[tokio::test]
    async fn rejected_login_leaves_no_session_behind() {
        let h = harness(None).await;
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&h.server)
            .await;

        let err = h.session.login("testuser", "wrong").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::InvalidCredentials)
        ));
        assert!(!h.store.has_session());
        assert!(h.session.requires_login());
    }

    #[tokio::test]
    async fn logout_clears_store_and_is_idempotent() {
        let h = harness(Some(("tok", "ref"))).await;
        h.session.logout();
        assert!(!h.store.has_session());
        assert!(h.session.requires_login());

        // Logging out when already logged out must not fail.
        h.session.logout();
        assert!(!h.store.has_session());
    }

    #[tokio::test]
    async fn change_password_surfaces_rejection_detail() {
        let h = harness(Some(("tok", "ref"))).await;
        Mock::given(method("POST"))
            .and(path("/auth/change-password/"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "detail": "Incorrect current password."
            })))
            .expect(1)
            .mount(&h.server)
            .await;

        let err = h.session.change_password("wrong", "new-pw").await.unwrap_err();
        assert!(err.to_string().contains("Incorrect current password."));
    }

    #[tokio::test]
    async fn update_profile_refreshes_cached_identity() {
        let h = harness(Some(("tok", "ref"))).await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_user_json()))
            .expect(1)
            .mount(&h.server)
            .await;
        let mut updated = test_user_json();
        updated["timezone"] = serde_json::json!("Europe/Berlin");
        Mock::given(method("PATCH"))
            .and(path("/auth/me/"))
            .and(body_json(serde_json::json!({ "timezone": "Europe/Berlin" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(updated))
            .expect(1)
            .mount(&h.server)
            .await;

        h.session.confirm().await;
        let patch = ProfileUpdate {
            timezone: Some("Europe/Berlin".to_string()),
            ..Default::default()
        };
        let user = h.session.update_profile(&patch).await.unwrap();
        assert_eq!(user.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(
            h.session.user().unwrap().timezone.as_deref(),
            Some("Europe/Berlin")
        );
    }
}
