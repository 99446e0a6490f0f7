//! Authenticated request gateway for the nudge backend.
//!
//! Every API call the application makes goes through [`Gateway::send`],
//! which attaches the stored access token and recovers from credential
//! expiry: the first 401 triggers a token refresh and one retry, and any
//! number of concurrently-failing requests collapse into a single refresh
//! call. When the session cannot be recovered the stored credentials are
//! cleared and a [`SessionEvent::Expired`] is broadcast so the UI layer
//! can present the login entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::auth::CredentialStore;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Capacity of the session-event channel. Expiry events are rare (at most
/// one per forced logout), so a small buffer is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Signal emitted by the gateway when the session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session could not be recovered: stored credentials were cleared
    /// and the application should navigate to the login entry point.
    Expired,
}

/// The shared outcome of an in-flight token refresh. Concurrent callers
/// clone the handle and await the same result instead of starting their own
/// refresh call.
type RefreshFlight = Shared<BoxFuture<'static, bool>>;

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
}

/// Authenticated API gateway.
/// Clone is cheap - the inner state (connection pool included) is shared.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    client: Client,
    base_url: String,
    store: Arc<CredentialStore>,
    /// Single-flight refresh slot: absent while no refresh is running.
    /// The refresh future clears the slot itself before resolving, so the
    /// handle is released on every settlement path.
    refresh_flight: Mutex<Option<RefreshFlight>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Gateway {
    /// Create a gateway for the given API base URL, reading and writing
    /// tokens through the given store.
    pub fn new(base_url: impl Into<String>, store: Arc<CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let base_url = base_url.into();
        Ok(Self {
            inner: Arc::new(GatewayInner {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                store,
                refresh_flight: Mutex::new(None),
                events,
            }),
        })
    }

    /// Subscribe to session lifecycle events (forced logout).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Perform one logical API call with authentication and bounded
    /// recovery from access-token expiry.
    ///
    /// Transport failures are returned as errors and never interpreted as
    /// an authentication problem. Every response that reaches the client,
    /// including a terminal 401, is returned as `Ok` so callers can branch
    /// on status the same way for all endpoints.
    pub async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let first = self.issue(method.clone(), path, body).await?;
        if first.status() != StatusCode::UNAUTHORIZED {
            return Ok(first);
        }

        if self.refresh_access_token().await {
            // One retry with the fresh token; its outcome is terminal
            // whatever the status, so a second 401 cannot loop.
            return self.issue(method, path, body).await;
        }

        self.terminate_session();
        Ok(first)
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.send::<serde_json::Value>(Method::GET, path, None).await
    }

    pub async fn post<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn patch<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.send::<serde_json::Value>(Method::DELETE, path, None).await
    }

    pub async fn delete_with_body<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::DELETE, path, Some(body)).await
    }

    /// POST to a public endpoint with no Authorization header and no 401
    /// recovery. Used for token issuance, where a stale stored token must
    /// not leak onto the request or turn a wrong password into a refresh
    /// attempt.
    pub async fn post_public<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = self.inner.endpoint(path);
        let response = self
            .inner
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(ApiError::Network)?;
        Ok(response)
    }

    /// Issue a single request, attaching the current access token if one is
    /// stored. Public endpoints go out unauthenticated; the gateway never
    /// blocks on a missing token.
    async fn issue<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = self.inner.endpoint(path);
        let mut request = self.inner.client.request(method, &url);
        if let Some(token) = self.inner.store.access_token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(ApiError::Network)?;
        Ok(response)
    }

    /// Request a token refresh, joining an in-flight one if present.
    /// Returns whether a fresh access token is now stored.
    async fn refresh_access_token(&self) -> bool {
        let flight = {
            let mut slot = self.inner.refresh_flight.lock();
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight: RefreshFlight = async move {
                        let refreshed = inner.do_refresh().await;
                        // Release the slot before any waiter observes the
                        // outcome; the next 401 opens a new refresh window.
                        inner.refresh_flight.lock().take();
                        refreshed
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Clear the stored credentials and announce the forced logout.
    fn terminate_session(&self) {
        warn!("session could not be recovered, clearing stored credentials");
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "failed to clear credential store");
        }
        // No subscribers is fine (e.g. headless use); the event is advisory.
        let _ = self.inner.events.send(SessionEvent::Expired);
    }
}

impl GatewayInner {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Every failure maps to `false` with the store untouched; the caller
    /// decides whether that tears the session down. Must not panic: all
    /// waiters of the shared flight depend on this resolving.
    async fn do_refresh(&self) -> bool {
        let Some(refresh) = self.store.refresh_token() else {
            debug!("no refresh token stored, skipping refresh call");
            return false;
        };

        debug!("access token rejected, refreshing");
        let url = self.endpoint("/auth/refresh/");
        let response = match self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "token refresh request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "token refresh rejected");
            return false;
        }

        let body: RefreshResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "invalid token refresh response");
                return false;
            }
        };

        match self.store.store_access(&body.access) {
            Ok(()) => {
                debug!("access token refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to persist refreshed access token");
                false
            }
        }
    }
}
