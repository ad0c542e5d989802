use super::*;
use crate::{config::Settings, ClientEvent};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use shared::protocol::AuthTokens;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};

#[derive(Clone, Default)]
struct AuthBackend {
    logout_bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
    logout_fails: bool,
    profile_fails: bool,
}

fn member_json() -> Value {
    serde_json::json!({
        "id": "u-1",
        "email": "ama@thogmi.org",
        "first_name": "Ama",
        "last_name": "Owusu",
        "user_type": "member",
        "branch_name": "Accra Central"
    })
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["password"] == "correct horse" {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "Login successful",
                "tokens": {"access": "access-1", "refresh": "refresh-1"},
                "user": member_json()
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "Invalid credentials"})),
        )
    }
}

async fn logout(
    State(backend): State<AuthBackend>,
    Json(body): Json<Value>,
) -> StatusCode {
    backend.logout_bodies.lock().push(body);
    if backend.logout_fails {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn profile(
    State(backend): State<AuthBackend>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if backend.profile_fails {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some("Bearer access-1") => Ok(Json(member_json())),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

async fn spawn_backend(backend: AuthBackend) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/api/v1/auth/login/", post(login))
        .route("/api/v1/auth/logout/", post(logout))
        .route("/api/v1/auth/profile/", get(profile))
        .with_state(backend);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/api/v1")
}

fn service(base: String, tokens: TokenStore) -> (AuthService, broadcast::Receiver<ClientEvent>) {
    let settings = Settings {
        api_base_url: base,
        ..Settings::default()
    };
    let (events, rx) = broadcast::channel(16);
    let api = ApiClient::new(&settings, tokens, events).expect("client");
    (AuthService::new(api), rx)
}

fn credentials(password: &str) -> LoginCredentials {
    LoginCredentials {
        email: "ama@thogmi.org".into(),
        password: password.into(),
        user_type: None,
    }
}

fn signed_in(with_user: bool) -> TokenStore {
    let tokens = TokenStore::in_memory();
    tokens.set_tokens(&AuthTokens {
        access: "access-1".into(),
        refresh: "refresh-1".into(),
    });
    if with_user {
        tokens.set_user(&serde_json::from_value(member_json()).unwrap());
    }
    tokens
}

#[tokio::test]
async fn login_stores_tokens_and_user() {
    let base = spawn_backend(AuthBackend::default()).await;
    let tokens = TokenStore::in_memory();
    let (auth, _) = service(base, tokens.clone());

    let user = auth.login(&credentials("correct horse")).await.unwrap();

    assert_eq!(user.display_name(), "Ama Owusu");
    assert_eq!(tokens.access_token().as_deref(), Some("access-1"));
    assert_eq!(tokens.refresh_token().as_deref(), Some("refresh-1"));
    assert_eq!(auth.current_user(), Some(user));
}

#[tokio::test]
async fn rejected_login_reports_detail_without_redirect() {
    let base = spawn_backend(AuthBackend::default()).await;
    let tokens = TokenStore::in_memory();
    let (auth, mut events) = service(base, tokens.clone());

    let err = auth.login(&credentials("wrong")).await.unwrap_err();

    assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
    assert_eq!(err.user_message(), "Invalid credentials");
    assert!(!tokens.is_authenticated());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn logout_blacklists_refresh_token_and_clears_session() {
    let backend = AuthBackend::default();
    let base = spawn_backend(backend.clone()).await;
    let tokens = signed_in(true);
    let (auth, _) = service(base, tokens.clone());

    auth.logout().await;

    assert_eq!(
        *backend.logout_bodies.lock(),
        vec![serde_json::json!({"refresh": "refresh-1"})]
    );
    assert!(tokens.get_tokens().is_none());
    assert!(tokens.get_user().is_none());
}

#[tokio::test]
async fn logout_clears_session_even_when_backend_fails() {
    let backend = AuthBackend {
        logout_fails: true,
        ..AuthBackend::default()
    };
    let base = spawn_backend(backend).await;
    let tokens = signed_in(true);
    let (auth, _) = service(base, tokens.clone());

    auth.logout().await;

    assert!(!tokens.is_authenticated());
}

#[tokio::test]
async fn restore_fetches_profile_when_user_is_missing() {
    let base = spawn_backend(AuthBackend::default()).await;
    let tokens = signed_in(false);
    let (auth, _) = service(base, tokens.clone());

    let user = auth.restore().await.expect("restored user");

    assert_eq!(user.email, "ama@thogmi.org");
    assert_eq!(tokens.get_user(), Some(user));
}

#[tokio::test]
async fn restore_failure_drops_the_session() {
    let backend = AuthBackend {
        profile_fails: true,
        ..AuthBackend::default()
    };
    let base = spawn_backend(backend).await;
    let tokens = signed_in(false);
    let (auth, _) = service(base, tokens.clone());

    assert!(auth.restore().await.is_none());
    assert!(!tokens.is_authenticated());
}

#[tokio::test]
async fn restore_without_tokens_makes_no_request() {
    let (auth, _) = service("http://127.0.0.1:9/api/v1".into(), TokenStore::in_memory());
    assert!(auth.restore().await.is_none());
}
