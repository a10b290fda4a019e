use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiRequest, Transport};
use crate::config::Credentials;
use crate::model::{LoginRequest, RefreshRequest, TokenResponse};

/// Minimum pause between two failed refresh attempts.
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Longest a token is used before renewal, whatever lifetime the server claims.
const MAX_RENEW_AFTER: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login failed: {0}")]
    Login(ApiError),
    #[error("token refresh failed: {0}")]
    Refresh(ApiError),
    #[error("not logged in")]
    NotLoggedIn,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Instant,
}

impl Credential {
    /// Renewal is due after half the advertised lifetime.
    fn from_response(response: TokenResponse, now: Instant) -> Self {
        let renew_after = Duration::try_from_secs_f64(response.expires_in.max(0.0) / 2.0)
            .map_or(MAX_RENEW_AFTER, |half| half.min(MAX_RENEW_AFTER));
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: now.checked_add(renew_after).unwrap_or(now),
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    current: Option<Credential>,
    retry_refresh_at: Option<Instant>,
}

/// Anything that can hand out the access token currently in use.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn current_token(&self) -> Option<String>;
}

pub struct CredentialManager {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    // Held across the network call: one login or refresh in flight, others wait for it.
    state: Mutex<TokenState>,
}

impl CredentialManager {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            state: Mutex::new(TokenState::default()),
        }
    }

    pub async fn login(&self) -> Result<String, AuthError> {
        self.acquire(true, false).await
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        self.acquire(false, false).await
    }

    #[cfg(test)]
    async fn expires_at(&self) -> Option<Instant> {
        self.state.lock().await.current.as_ref().map(|c| c.expires_at)
    }

    pub async fn acquire(&self, force_login: bool, force_renew: bool) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;

        if force_login {
            let credential = self.request_login().await?;
            let token = credential.access_token.clone();
            state.current = Some(credential);
            state.retry_refresh_at = None;
            return Ok(token);
        }

        let now = Instant::now();
        let Some(current) = state.current.clone() else {
            return Err(AuthError::NotLoggedIn);
        };

        let expired = now >= current.expires_at;
        let may_retry = state.retry_refresh_at.map_or(true, |at| now >= at);
        if force_renew || (expired && may_retry) {
            if expired {
                info!("access token expired, refreshing");
            }
            match self.request_refresh(&current).await {
                Ok(renewed) => {
                    let token = renewed.access_token.clone();
                    state.current = Some(renewed);
                    state.retry_refresh_at = None;
                    return Ok(token);
                }
                Err(err) => {
                    warn!(error = %err, "token refresh failed, reusing current token");
                    state.retry_refresh_at = Some(now + REFRESH_RETRY_DELAY);
                }
            }
        }

        Ok(current.access_token)
    }

    async fn request_login(&self) -> Result<Credential, AuthError> {
        let body = serde_json::to_value(LoginRequest {
            user_name: &self.credentials.username,
            password: &self.credentials.password,
        })
        .map_err(|err| AuthError::Login(ApiError::Decode(err.to_string())))?;

        let response = self
            .transport
            .execute(ApiRequest::post("/api/accounts/login", body))
            .await
            .map_err(AuthError::Login)?;
        let tokens: TokenResponse = serde_json::from_value(response)
            .map_err(|err| AuthError::Login(ApiError::Decode(err.to_string())))?;

        info!("api login successful");
        debug!(expires_in = tokens.expires_in, "received access token");
        Ok(Credential::from_response(tokens, Instant::now()))
    }

    async fn request_refresh(&self, current: &Credential) -> Result<Credential, AuthError> {
        let body = serde_json::to_value(RefreshRequest {
            access_token: &current.access_token,
            refresh_token: &current.refresh_token,
        })
        .map_err(|err| AuthError::Refresh(ApiError::Decode(err.to_string())))?;

        let response = self
            .transport
            .execute(ApiRequest::post("/api/accounts/refresh_token", body))
            .await
            .map_err(AuthError::Refresh)?;
        let tokens: TokenResponse = serde_json::from_value(response)
            .map_err(|err| AuthError::Refresh(ApiError::Decode(err.to_string())))?;

        info!("token refresh successful");
        Ok(Credential::from_response(tokens, Instant::now()))
    }
}

#[async_trait]
impl TokenSource for CredentialManager {
    async fn current_token(&self) -> Option<String> {
        self.access_token().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Method;
    use crate::test_support::{test_credentials, token_response, FakeTransport};

    const LOGIN: &str = "/api/accounts/login";
    const REFRESH: &str = "/api/accounts/refresh_token";

    fn manager(transport: &Arc<FakeTransport>) -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(transport.clone(), test_credentials()))
    }

    #[tokio::test(start_paused = true)]
    async fn login_halves_advertised_lifetime() {
        let transport = FakeTransport::new();
        transport.respond(Method::Post, LOGIN, token_response("access-1", 3600.0));
        let manager = manager(&transport);

        let started = Instant::now();
        let token = manager.login().await.expect("login");

        assert_eq!(token, "access-1");
        let expires_at = manager.expires_at().await.expect("expiry");
        assert_eq!(expires_at - started, Duration::from_secs(1800));

        let login_call = &transport.calls()[0];
        assert_eq!(
            login_call.body,
            Some(serde_json::json!({"userName": "user@example.com", "password": "hunter2"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cached_token_is_reused_without_network() {
        let transport = FakeTransport::new();
        transport.respond(Method::Post, LOGIN, token_response("access-1", 3600.0));
        let manager = manager(&transport);
        manager.login().await.expect("login");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.access_token().await })
            })
            .collect();
        for handle in handles {
            let token = handle.await.expect("join").expect("token");
            assert_eq!(token, "access-1");
        }

        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_triggers_exactly_one_refresh() {
        let transport = FakeTransport::new();
        transport.respond(Method::Post, LOGIN, token_response("access-1", 3600.0));
        transport.respond(Method::Post, REFRESH, token_response("access-2", 3600.0));
        let manager = manager(&transport);
        manager.login().await.expect("login");

        tokio::time::advance(Duration::from_secs(1801)).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.access_token().await })
            })
            .collect();
        for handle in handles {
            let token = handle.await.expect("join").expect("token");
            assert_eq!(token, "access-2");
        }

        assert_eq!(transport.count(Method::Post, REFRESH), 1);
        let refresh_call = transport
            .calls()
            .into_iter()
            .find(|call| call.path == REFRESH)
            .expect("refresh call");
        assert_eq!(
            refresh_call.body,
            Some(serde_json::json!({"accessToken": "access-1", "refreshToken": "refresh-access-1"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_returns_stale_token() {
        let transport = FakeTransport::new();
        transport.respond(Method::Post, LOGIN, token_response("access-1", 60.0));
        transport.fail(Method::Post, REFRESH, 500);
        let manager = manager(&transport);
        manager.login().await.expect("login");

        tokio::time::advance(Duration::from_secs(31)).await;
        let token = manager.access_token().await.expect("stale token");
        assert_eq!(token, "access-1");

        // within the retry delay no second refresh is attempted
        manager.access_token().await.expect("stale token");
        assert_eq!(transport.count(Method::Post, REFRESH), 1);

        tokio::time::advance(REFRESH_RETRY_DELAY).await;
        manager.access_token().await.expect("stale token");
        assert_eq!(transport.count(Method::Post, REFRESH), 2);
    }

    #[tokio::test]
    async fn token_before_login_is_rejected() {
        let transport = FakeTransport::new();
        let manager = manager(&transport);

        let err = manager.access_token().await.expect_err("not logged in");

        assert!(matches!(err, AuthError::NotLoggedIn));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_login_is_reported() {
        let transport = FakeTransport::new();
        transport.fail(Method::Post, LOGIN, 401);
        let manager = manager(&transport);

        let err = manager.login().await.expect_err("login must fail");

        assert!(matches!(err, AuthError::Login(ref api) if api.status() == Some(401)));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_lifetime_is_capped_instead_of_failing() {
        // Arrange
        let transport = FakeTransport::new();
        transport.respond(Method::Post, LOGIN, token_response("access-1", 1e300));
        let manager = manager(&transport);

        // Act
        let started = Instant::now();
        let token = manager.login().await.expect("login");

        // Assert
        assert_eq!(token, "access-1");
        let expires_at = manager.expires_at().await.expect("expiry");
        assert_eq!(expires_at - started, MAX_RENEW_AFTER);
    }
}
