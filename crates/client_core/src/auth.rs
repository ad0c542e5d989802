use serde_json::json;
use shared::protocol::{AuthResponse, LoginCredentials, User};
use tracing::{info, warn};

use crate::{error::Result, http::ApiClient, session::TokenStore};

pub const LOGIN_ENDPOINT: &str = "/auth/login/";
pub const LOGOUT_ENDPOINT: &str = "/auth/logout/";
pub const PROFILE_ENDPOINT: &str = "/auth/profile/";

/// Login, logout and profile against the main API. Owns every write to the
/// token store apart from the HTTP client's refresh.
#[derive(Clone)]
pub struct AuthService {
    api: ApiClient,
}

impl AuthService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    fn tokens(&self) -> &TokenStore {
        self.api.tokens()
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<User> {
        let response: AuthResponse = self
            .api
            .post_public(LOGIN_ENDPOINT, credentials)
            .await
            .inspect_err(|err| warn!(email = %credentials.email, "login failed: {err}"))?;
        self.tokens().set_tokens(&response.tokens);
        self.tokens().set_user(&response.user);
        info!(user_id = %response.user.id, "logged in");
        Ok(response.user)
    }

    /// Tells the backend to blacklist the refresh token, then clears the
    /// session whatever the outcome.
    pub async fn logout(&self) {
        if let Some(refresh) = self.tokens().refresh_token() {
            let result: Result<serde_json::Value> = self
                .api
                .post(LOGOUT_ENDPOINT, &json!({ "refresh": refresh }))
                .await;
            if let Err(err) = result {
                warn!("logout request failed: {err}");
            }
        }
        self.tokens().clear_all();
        info!("logged out");
    }

    /// Fetches the profile and refreshes the cached copy.
    pub async fn profile(&self) -> Result<User> {
        let user: User = self.api.get(PROFILE_ENDPOINT).await?;
        self.tokens().set_user(&user);
        Ok(user)
    }

    pub fn current_user(&self) -> Option<User> {
        self.tokens().get_user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens().is_authenticated()
    }

    /// Startup check: the cached user, fetching the profile when tokens exist
    /// without one. Any failure drops the session.
    pub async fn restore(&self) -> Option<User> {
        if !self.is_authenticated() {
            return None;
        }
        if let Some(user) = self.current_user() {
            return Some(user);
        }
        match self.profile().await {
            Ok(user) => Some(user),
            Err(err) => {
                warn!("session restore failed: {err}");
                self.tokens().clear_all();
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
