use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;

use crate::firewall::Iptables;
use crate::policy::PolicyStore;
use crate::session::{BanKind, BanRecord, SessionError, SessionStore};

const TOKEN_LIFETIME_HOURS: i64 = 2;

/// Shared state for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub firewall: Arc<Iptables>,
    pub policy: PolicyStore,
    pub token_secret: String,
    pub log: slog::Logger,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: usize,
}

// User-facing failures stay within the semantic kinds; filter internals are
// never surfaced.
struct ApiError(StatusCode, &'static str);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "message": self.1 }));
        (self.0, body).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> ApiError {
        match error {
            SessionError::BadCredentials => ApiError(StatusCode::UNAUTHORIZED, "Invalid credentials"),
            SessionError::Banned => ApiError(StatusCode::FORBIDDEN, "Account is banned"),
            _ => ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/health", get(health))
        .route(
            "/admin/filter/sites",
            post(add_blocked_site).delete(remove_blocked_site),
        )
        .route("/admin/filter/categories", post(toggle_category))
        .route("/admin/clients", get(list_clients))
        .route("/admin/clients/:id", patch(update_client))
        .layer(middleware::from_fn(lan_only))
        .with_state(state)
}

/// Serve the gateway until the shutdown signal flips. The bind address is
/// expected to be the hotspot interface or loopback; the LAN-only
/// middleware is a second line of defence.
pub async fn serve(
    state: AppState,
    bind_addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let log = state.log.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    slog::info!(log, "gateway listening"; "addr" => bind_addr.to_string());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
}

// Requests from outside the private ranges are rejected at ingress.
async fn lan_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !is_lan_source(addr.ip()) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(next.run(request).await)
}

fn is_lan_source(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn issue_token(secret: &str, user_id: &str, role: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_owned(),
        role: role.to_owned(),
        exp: (Utc::now() + chrono::Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp() as usize,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &jsonwebtoken::Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

fn bearer_claims(headers: &HeaderMap, secret: &str) -> Option<Claims> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer "))?;
    verify_token(secret, token)
}

fn require_admin(headers: &HeaderMap, secret: &str) -> Result<Claims, ApiError> {
    let claims = bearer_claims(headers, secret)
        .ok_or(ApiError(StatusCode::UNAUTHORIZED, "Token missing or invalid"))?;
    if claims.role != "admin" {
        return Err(ApiError(StatusCode::FORBIDDEN, "Unauthorized"));
    }
    Ok(claims)
}

#[derive(Debug, serde::Deserialize)]
struct LoginRequest {
    user_id: String,
    password: String,
}

#[derive(Debug, serde::Deserialize)]
struct LogoutRequest {
    user_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct SiteRequest {
    hostname: String,
}

#[derive(Debug, serde::Deserialize)]
struct CategoryRequest {
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct ClientUpdateRequest {
    tier: Option<String>,
    password: Option<String>,
    blocked: Option<bool>,
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let client_ip = addr.ip();
    let session = state
        .sessions
        .login(&body.user_id, &body.password, client_ip)
        .await?;

    // The allowance must be installed before the client hears success. A
    // filter failure fails the login and rolls the session back.
    if let Err(e) = state.firewall.allow_client(session.client_ip.ip()).await {
        slog::error!(state.log, "allow_client failed, rolling back login";
            "user" => &body.user_id, "ip" => client_ip.to_string(), "error" => e.to_string());
        let _ = state.sessions.logout(&body.user_id).await;
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            "Unable to enable network access",
        ));
    }

    let role = state
        .sessions
        .user_role(&body.user_id)
        .await?
        .unwrap_or_else(|| "student".to_owned());
    let token = issue_token(&state.token_secret, &body.user_id, &role)
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))?;
    Ok(Json(serde_json::json!({ "token": token, "role": role })).into_response())
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LogoutRequest>,
) -> Result<Response, ApiError> {
    let claims = bearer_claims(&headers, &state.token_secret)
        .ok_or(ApiError(StatusCode::UNAUTHORIZED, "Token missing or invalid"))?;
    if claims.sub != body.user_id && claims.role != "admin" {
        return Err(ApiError(StatusCode::FORBIDDEN, "Unauthorized"));
    }

    if let Some(ip) = state.sessions.logout(&body.user_id).await? {
        if let Err(e) = state.firewall.deny_client(ip).await {
            slog::error!(state.log, "deny_client failed on logout";
                "user" => &body.user_id, "ip" => ip.to_string(), "error" => e.to_string());
        }
    }
    Ok(Json(serde_json::json!({ "message": "Logout successful" })).into_response())
}

async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn add_blocked_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SiteRequest>,
) -> Result<Response, ApiError> {
    require_admin(&headers, &state.token_secret)?;
    let config = state
        .policy
        .add_manual_block(&body.hostname)
        .await
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))?;
    if let Err(e) = state.firewall.sync_policy(config).await {
        slog::error!(state.log, "policy sync failed after block";
            "hostname" => &body.hostname, "error" => e.to_string());
        return Err(ApiError(StatusCode::SERVICE_UNAVAILABLE, "Filter update failed"));
    }
    Ok(Json(serde_json::json!({ "message": format!("Blocked {}", body.hostname) })).into_response())
}

async fn remove_blocked_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SiteRequest>,
) -> Result<Response, ApiError> {
    require_admin(&headers, &state.token_secret)?;
    let config = state
        .policy
        .remove_manual_block(&body.hostname)
        .await
        .map_err(|_| ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))?;
    if let Err(e) = state.firewall.sync_policy(config).await {
        slog::error!(state.log, "policy sync failed after unblock";
            "hostname" => &body.hostname, "error" => e.to_string());
        return Err(ApiError(StatusCode::SERVICE_UNAVAILABLE, "Filter update failed"));
    }
    Ok(
        Json(serde_json::json!({ "message": format!("Unblocked {}", body.hostname) }))
            .into_response(),
    )
}

async fn toggle_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CategoryRequest>,
) -> Result<Response, ApiError> {
    require_admin(&headers, &state.token_secret)?;
    let (config, active) = state
        .policy
        .toggle_category(&body.name)
        .await
        .map_err(|e| match e {
            crate::policy::PolicyError::UnknownCategory(_) => {
                ApiError(StatusCode::NOT_FOUND, "Category not found")
            }
            _ => ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        })?;
    if let Err(e) = state.firewall.sync_policy(config).await {
        slog::error!(state.log, "policy sync failed after category toggle";
            "category" => &body.name, "error" => e.to_string());
        return Err(ApiError(StatusCode::SERVICE_UNAVAILABLE, "Filter update failed"));
    }
    Ok(Json(serde_json::json!({ "message": format!("Toggled {}", body.name), "active": active }))
        .into_response())
}

async fn list_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&headers, &state.token_secret)?;
    let clients = state.sessions.list_clients().await?;
    let clients: Vec<serde_json::Value> = clients
        .into_iter()
        .map(|client| {
            let status = derived_status(
                client.ban_kind.as_deref(),
                client.session_state.as_deref(),
            );
            serde_json::json!({
                "user_id": client.user_id,
                "role": client.role,
                "tier": client.tier,
                "status": status,
                "client_ip": client.client_ip.map(|network| network.ip().to_string()),
                "last_seen": client.last_seen,
                "last_activity": client.last_activity,
                "ban_kind": client.ban_kind,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "clients": clients })).into_response())
}

fn derived_status(ban_kind: Option<&str>, session_state: Option<&str>) -> &'static str {
    match (ban_kind, session_state) {
        (Some(_), _) => "blocked",
        (None, Some("active")) => "online",
        _ => "offline",
    }
}

async fn update_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<ClientUpdateRequest>,
) -> Result<Response, ApiError> {
    require_admin(&headers, &state.token_secret)?;

    if state.sessions.user_role(&user_id).await?.is_none() {
        return Err(ApiError(StatusCode::NOT_FOUND, "Not found"));
    }

    state
        .sessions
        .update_user(&user_id, body.tier.as_deref(), body.password.as_deref())
        .await?;

    match body.blocked {
        Some(true) => {
            // Revoke forwarding first so the ban is never visible while the
            // client still forwards.
            if let Some(ip) = state.sessions.active_ip_for(&user_id).await? {
                if let Err(e) = state.firewall.deny_client(ip).await {
                    slog::error!(state.log, "deny_client failed for admin block";
                        "user" => &user_id, "ip" => ip.to_string(), "error" => e.to_string());
                }
            }
            let now = Utc::now();
            state
                .sessions
                .insert_ban(&BanRecord {
                    user_id: user_id.clone(),
                    kind: BanKind::Permanent,
                    confidence: 1.0,
                    reason: "Blocked by administrator".to_owned(),
                    blocked_at: now,
                    expires_at: None,
                })
                .await?;
        }
        Some(false) => {
            state.sessions.lift_ban(&user_id).await?;
        }
        None => {}
    }

    Ok(Json(serde_json::json!({ "message": "Client updated" })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_token_round_trip() {
        let token = issue_token("secret", "U1", "student").unwrap();
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "U1");
        assert_eq!(claims.role, "student");
    }

    #[test]
    fn test_token_rejects_wrong_secret() {
        let token = issue_token("secret", "U1", "student").unwrap();
        assert!(verify_token("other", &token).is_none());
    }

    #[test]
    fn test_bearer_claims_parsing() {
        let token = issue_token("secret", "admin1", "admin").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        let claims = bearer_claims(&headers, "secret").unwrap();
        assert_eq!(claims.role, "admin");

        let empty = HeaderMap::new();
        assert!(bearer_claims(&empty, "secret").is_none());
    }

    #[test]
    fn test_admin_guard() {
        let student = issue_token("secret", "U1", "student").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", student).parse().unwrap(),
        );
        let error = require_admin(&headers, "secret").err().unwrap();
        assert_eq!(error.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_lan_source_check() {
        assert!(is_lan_source(IpAddr::from_str("192.168.50.23").unwrap()));
        assert!(is_lan_source(IpAddr::from_str("10.1.2.3").unwrap()));
        assert!(is_lan_source(IpAddr::from_str("172.16.0.9").unwrap()));
        assert!(is_lan_source(IpAddr::from_str("127.0.0.1").unwrap()));
        assert!(!is_lan_source(IpAddr::from_str("93.184.216.34").unwrap()));
        assert!(!is_lan_source(IpAddr::from_str("2001:db8::1").unwrap()));
    }

    #[test]
    fn test_derived_status() {
        assert_eq!(derived_status(Some("permanent"), Some("active")), "blocked");
        assert_eq!(derived_status(None, Some("active")), "online");
        assert_eq!(derived_status(None, Some("inactive")), "offline");
        assert_eq!(derived_status(None, None), "offline");
    }
}
