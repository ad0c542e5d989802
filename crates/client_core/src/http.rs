use std::sync::Arc;

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Client, Method, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{AuthTokens, RefreshRequest, RefreshResponse},
};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    cache::QueryCache,
    config::Settings,
    error::{ClientError, Result},
    session::TokenStore,
    ClientEvent,
};

pub const LOGIN_ROUTE: &str = "/auth/login";
pub const REFRESH_ENDPOINT: &str = "auth/token/refresh/";

struct ApiClientShared {
    http: Client,
    tokens: TokenStore,
    refresh_url: Url,
    events: broadcast::Sender<ClientEvent>,
    cache: Option<QueryCache>,
}

/// JSON REST client that attaches the bearer token and recovers from one
/// expired access token per request.
#[derive(Clone)]
pub struct ApiClient {
    shared: Arc<ApiClientShared>,
    base: Url,
}

impl ApiClient {
    pub fn new(
        settings: &Settings,
        tokens: TokenStore,
        events: broadcast::Sender<ClientEvent>,
    ) -> Result<Self> {
        Self::build(settings, tokens, events, None)
    }

    /// Like [`new`](Self::new), and a forced logout also forgets every
    /// query in `cache`.
    pub fn with_cache(settings: &Settings, tokens: TokenStore, cache: QueryCache) -> Result<Self> {
        let events = cache.events().clone();
        Self::build(settings, tokens, events, Some(cache))
    }

    fn build(
        settings: &Settings,
        tokens: TokenStore,
        events: broadcast::Sender<ClientEvent>,
        cache: Option<QueryCache>,
    ) -> Result<Self> {
        let base = settings.api_base()?;
        let refresh_url = base.join(REFRESH_ENDPOINT)?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            shared: Arc::new(ApiClientShared {
                http,
                tokens,
                refresh_url,
                events,
                cache,
            }),
            base,
        })
    }

    /// Same session and refresh endpoint, different API root.
    pub fn rebased(&self, base: Url) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            base,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.shared.tokens
    }

    pub fn events(&self) -> &broadcast::Sender<ClientEvent> {
        &self.shared.events
    }

    pub fn url(&self, endpoint: &str) -> Result<Url> {
        Ok(self.base.join(endpoint.trim_start_matches('/'))?)
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let value = self.request(Method::GET, endpoint, None, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_with_query<T, Q>(&self, endpoint: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let query = serde_json::to_value(query)?;
        let value = self
            .request(Method::GET, endpoint, Some(query), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn post<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::POST, endpoint, body).await
    }

    pub async fn put<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PUT, endpoint, body).await
    }

    pub async fn patch<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PATCH, endpoint, body).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<()> {
        self.request(Method::DELETE, endpoint, None, None).await?;
        Ok(())
    }

    /// POST without the refresh/redirect handling, for credential exchanges
    /// where a 401 means "wrong password" rather than "session expired".
    pub async fn post_public<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(endpoint)?;
        let body = serde_json::to_value(body)?;
        let response = self
            .shared
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;
        let value = decode_response(response).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send_json<T, B>(&self, method: Method, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body)?;
        let value = self.request(method, endpoint, None, Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends one request. A 401 triggers exactly one token refresh and, if
    /// that succeeds, exactly one retry; any other outcome of a 401 ends the
    /// session.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<Value>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.url(endpoint)?;
        let response = self
            .execute(&method, &url, query.as_ref(), body.as_ref())
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            debug!(%url, "access token rejected; attempting refresh");
            if !self.refresh_tokens().await {
                self.handle_unauthorized();
                return Err(ClientError::AuthenticationRequired);
            }
            let retried = self
                .execute(&method, &url, query.as_ref(), body.as_ref())
                .await?;
            if retried.status() == StatusCode::UNAUTHORIZED {
                warn!(%url, "request still unauthorized after token refresh");
                self.handle_unauthorized();
                return Err(ClientError::AuthenticationRequired);
            }
            retried
        } else {
            response
        };

        decode_response(response).await.inspect_err(|err| {
            error!(%url, "API request failed: {err}");
        })
    }

    async fn execute(
        &self,
        method: &Method,
        url: &Url,
        query: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<Response> {
        let mut request = self
            .shared
            .http
            .request(method.clone(), url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(token) = self.shared.tokens.access_token() {
            request = request.bearer_auth(token);
        }
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn refresh_tokens(&self) -> bool {
        let Some(refresh) = self.shared.tokens.refresh_token() else {
            debug!("no refresh token available");
            return false;
        };

        let result = self
            .shared
            .http
            .post(self.shared.refresh_url.clone())
            .header(ACCEPT, "application/json")
            .json(&RefreshRequest {
                refresh: refresh.clone(),
            })
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "token refresh rejected");
                return false;
            }
            Err(err) => {
                error!("token refresh failed: {err}");
                return false;
            }
        };

        match response.json::<RefreshResponse>().await {
            Ok(body) => {
                self.shared.tokens.set_tokens(&AuthTokens {
                    access: body.access,
                    refresh: body.refresh.unwrap_or(refresh),
                });
                debug!("access token refreshed");
                true
            }
            Err(err) => {
                error!("token refresh returned an unreadable body: {err}");
                false
            }
        }
    }

    /// Fail closed: drop the session and send the user to login.
    fn handle_unauthorized(&self) {
        self.shared.tokens.clear_all();
        if let Some(cache) = &self.shared.cache {
            cache.clear();
        }
        warn!(route = LOGIN_ROUTE, "session ended; login required");
        let _ = self.shared.events.send(ClientEvent::LoginRequired {
            route: LOGIN_ROUTE.to_string(),
        });
    }
}

async fn decode_response(response: Response) -> Result<Value> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
        let detail = serde_json::from_slice::<ApiError>(&bytes)
            .ok()
            .and_then(|body| body.message());
        return Err(ClientError::Status { status, detail });
    }

    if status == StatusCode::NO_CONTENT || bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
