//! HTTP surface: credential lifecycle endpoints under /auth, owner-scoped
//! project endpoints under /api/projects, and the SPA static fallback.
//!
//! Protected routes sit behind the `require_auth` layer: the ID token cookie
//! is verified before the handler runs, and the decoded claims travel to the
//! handler as a request extension. Verification failures other than expiry
//! are reported to clients as a generic invalid-token error; the precise
//! cause is only logged.

use crate::idp::{IdentityProvider, IdpError};
use crate::session::{
    auth_cookie_header, clear_cookie_header, AuthCookies, ACCESS_TOKEN_COOKIE, ID_TOKEN_COOKIE,
    REFRESH_TOKEN_COOKIE,
};
use crate::settings::Settings;
use crate::storage::{self, NewAnnotation};
use crate::verifier::{Claims, TokenKind, TokenVerifier, VerifyError};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64ct::Encoding;
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};

/// Upper bound on an uploaded video body. The framework default of 2 MiB is
/// far too small for video.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub verifier: TokenVerifier,
    pub idp: Arc<dyn IdentityProvider>,
}

// Security headers middleware
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// Session gate. Fails closed: without a verified ID token the downstream
/// handler never runs.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let cookies = AuthCookies::from_headers(request.headers());
    let Some(token) = cookies.id_token else {
        return json_error(StatusCode::UNAUTHORIZED, "Authorization required");
    };

    match state.verifier.verify(&token, TokenKind::Id).await {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(VerifyError::TokenExpired) => {
            json_error(StatusCode::UNAUTHORIZED, "Token has expired")
        }
        Err(err) => {
            tracing::warn!(%err, "id token verification failed");
            json_error(StatusCode::UNAUTHORIZED, "Invalid token")
        }
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/verify_sign_up", post(verify_sign_up))
        .route("/auth/login", post(login))
        .route("/auth/refresh_token", post(refresh_token))
        .route("/auth/verify_access_token", post(verify_access_token));

    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/api/projects/", get(list_projects).post(create_project))
        .route("/api/projects/{project_id}/delete", post(delete_project))
        .route(
            "/api/projects/{project_id}/upload",
            post(upload_video).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/api/projects/{project_id}/annotations",
            post(add_annotations),
        )
        .route("/api/projects/{project_id}/apply", post(apply_annotations))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    // Unmatched paths serve frontend assets, falling back to the SPA entry
    // document so client-side routes deep-link correctly.
    let spa = ServeDir::new(&state.settings.files.static_dir).not_found_service(ServeFile::new(
        state.settings.files.template_dir.join("index.html"),
    ));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback_service(spa)
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn serve(
    settings: Settings,
    db: DatabaseConnection,
    verifier: TokenVerifier,
    idp: Arc<dyn IdentityProvider>,
) -> miette::Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        db,
        verifier,
        idp,
    };

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);

    tracing::info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn internal_error() -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn append_cookie(headers: &mut HeaderMap, cookie: String) {
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            headers.append(axum::http::header::SET_COOKIE, value);
        }
        Err(_) => tracing::warn!("dropping Set-Cookie header with invalid bytes"),
    }
}

/// 3-30 characters, alphanumeric or underscore.
fn validate_username(username: &str) -> bool {
    (3..=30).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 8-50 characters.
fn validate_password(password: &str) -> bool {
    (8..=50).contains(&password.len())
}

/// Pull username/password out of a JSON body, enforcing the local format
/// rules before anything touches the network.
fn credentials_from(body: &Value) -> Result<(&str, &str), Response> {
    let username = body.get("username").and_then(|v| v.as_str());
    let password = body.get("password").and_then(|v| v.as_str());
    let (Some(username), Some(password)) = (username, password) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "Username and password are required",
        ));
    };
    if !validate_username(username) || !validate_password(password) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "Invalid username or password format",
        ));
    }
    Ok((username, password))
}

/// URL-safe SHA-256 of the client-supplied filename; uploads are stored
/// under this name.
fn hashed_filename(name: &str) -> String {
    base64ct::Base64UrlUnpadded::encode_string(&Sha256::digest(name.as_bytes()))
}

// ---- /auth ----

async fn register(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (username, password) = match credentials_from(&body) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let Some(email) = body.get("email").and_then(|v| v.as_str()).filter(|e| !e.is_empty())
    else {
        return json_error(StatusCode::BAD_REQUEST, "Email is required");
    };

    match state.idp.sign_up(username, password, email).await {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(json!({
                "message": "User registered",
                "user_sub": outcome.user_sub,
                "user_confirmed": outcome.user_confirmed,
            })),
        )
            .into_response(),
        Err(IdpError::UsernameExists) => {
            json_error(StatusCode::BAD_REQUEST, "Username already exists")
        }
        Err(err) => {
            tracing::error!(%err, "sign-up failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to register user")
        }
    }
}

async fn verify_sign_up(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let username = body.get("username").and_then(|v| v.as_str());
    let code = body.get("code").and_then(|v| v.as_str());
    let (Some(username), Some(code)) = (username, code) else {
        return json_error(StatusCode::BAD_REQUEST, "Username and code are required");
    };

    match state.idp.confirm_sign_up(username, code).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"message": "Sign up verified"})),
        )
            .into_response(),
        Err(err @ (IdpError::CodeMismatch | IdpError::NotAuthorized)) => {
            tracing::warn!(%err, "sign-up verification rejected");
            json_error(StatusCode::BAD_REQUEST, "Failed to verify sign up")
        }
        Err(err) => {
            tracing::error!(%err, "sign-up verification failed");
            json_error(StatusCode::BAD_REQUEST, "Failed to verify sign up")
        }
    }
}

async fn login(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (username, password) = match credentials_from(&body) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    match state.idp.login(username, password).await {
        Ok(tokens) => {
            // Cookie transport only; tokens never appear in the body.
            let mut response =
                (StatusCode::OK, Json(json!({"message": "Login successful"}))).into_response();
            let headers = response.headers_mut();
            append_cookie(headers, auth_cookie_header(ID_TOKEN_COOKIE, &tokens.id_token));
            append_cookie(
                headers,
                auth_cookie_header(ACCESS_TOKEN_COOKIE, &tokens.access_token),
            );
            append_cookie(
                headers,
                auth_cookie_header(REFRESH_TOKEN_COOKIE, &tokens.refresh_token),
            );
            response
        }
        Err(IdpError::NotAuthorized) => {
            json_error(StatusCode::UNAUTHORIZED, "Invalid username or password")
        }
        Err(err) => {
            tracing::error!(%err, "login failed");
            internal_error()
        }
    }
}

async fn refresh_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cookies = AuthCookies::from_headers(&headers);
    let Some(refresh) = cookies.refresh_token else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "Refresh token is missing in cookies",
        );
    };

    match state.idp.refresh(&refresh).await {
        Ok(access_token) => {
            let mut response = (
                StatusCode::OK,
                Json(json!({"message": "Token refreshed successfully"})),
            )
                .into_response();
            append_cookie(
                response.headers_mut(),
                auth_cookie_header(ACCESS_TOKEN_COOKIE, &access_token),
            );
            response
        }
        Err(IdpError::NotAuthorized) => {
            // Refresh token expired or revoked: force a fresh login.
            let mut response = json_error(
                StatusCode::UNAUTHORIZED,
                "Refresh token has expired. Please log in again.",
            );
            let headers = response.headers_mut();
            append_cookie(headers, clear_cookie_header(ID_TOKEN_COOKIE));
            append_cookie(headers, clear_cookie_header(ACCESS_TOKEN_COOKIE));
            append_cookie(headers, clear_cookie_header(REFRESH_TOKEN_COOKIE));
            response
        }
        Err(err) => {
            tracing::error!(%err, "token refresh failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to refresh token")
        }
    }
}

async fn logout(Extension(_claims): Extension<Claims>) -> Response {
    let mut response =
        (StatusCode::OK, Json(json!({"message": "Logout successful"}))).into_response();
    let headers = response.headers_mut();
    append_cookie(headers, clear_cookie_header(ID_TOKEN_COOKIE));
    append_cookie(headers, clear_cookie_header(ACCESS_TOKEN_COOKIE));
    append_cookie(headers, clear_cookie_header(REFRESH_TOKEN_COOKIE));
    response
}

async fn verify_access_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cookies = AuthCookies::from_headers(&headers);
    let Some(access_token) = cookies.access_token else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "Access token is missing in cookies",
        );
    };
    let Some(id_token) = cookies.id_token else {
        return json_error(StatusCode::UNAUTHORIZED, "ID token is missing in cookies");
    };

    let access_claims = match state.verifier.verify(&access_token, TokenKind::Access).await {
        Ok(claims) => claims,
        Err(err) => return verify_failure(err),
    };
    let id_claims = match state.verifier.verify(&id_token, TokenKind::Id).await {
        Ok(claims) => claims,
        Err(err) => return verify_failure(err),
    };

    (
        StatusCode::OK,
        Json(json!({
            "message": "Token is valid",
            "decoded_token": access_claims,
            "decoded_id_token": id_claims,
        })),
    )
        .into_response()
}

fn verify_failure(err: VerifyError) -> Response {
    match err {
        VerifyError::TokenExpired => json_error(StatusCode::UNAUTHORIZED, "Token has expired"),
        VerifyError::KeyResolution(err) => {
            tracing::error!(%err, "signing key resolution failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to verify token")
        }
        err => {
            tracing::warn!(%err, "token verification failed");
            json_error(StatusCode::UNAUTHORIZED, "Invalid token")
        }
    }
}

// ---- /api/projects ----

async fn create_project(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<Value>,
) -> Response {
    let title = body.get("title").and_then(|v| v.as_str());
    let description = body.get("description").and_then(|v| v.as_str());
    let (Some(title), Some(description)) = (title, description) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Title and description are required",
        );
    };
    if title.is_empty() || description.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "Title or description is empty");
    }

    match storage::create_project(&state.db, &claims.sub, title, description).await {
        Ok(project) => (
            StatusCode::CREATED,
            Json(json!({"message": "Project created", "project_id": project.id})),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%err, "project creation failed");
            internal_error()
        }
    }
}

async fn list_projects(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Response {
    match storage::list_projects(&state.db, &claims.sub).await {
        Ok(projects) => {
            let items: Vec<Value> = projects
                .into_iter()
                .map(|p| json!({"id": p.id, "title": p.title, "description": p.description}))
                .collect();
            (StatusCode::OK, Json(Value::Array(items))).into_response()
        }
        Err(err) => {
            tracing::error!(%err, "project listing failed");
            internal_error()
        }
    }
}

async fn delete_project(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<i32>,
) -> Response {
    // Not-owned and nonexistent are indistinguishable on purpose.
    match storage::delete_project(&state.db, project_id, &claims.sub).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"message": "Project deleted"})),
        )
            .into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Project not found"),
        Err(err) => {
            tracing::error!(%err, "project deletion failed");
            internal_error()
        }
    }
}

async fn upload_video(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<i32>,
    mut multipart: Multipart,
) -> Response {
    match storage::find_project(&state.db, project_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Project not found"),
        Err(err) => {
            tracing::error!(%err, "project lookup failed");
            return internal_error();
        }
    }

    let mut video: Option<(String, axum::body::Bytes)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("video") {
                    continue;
                }
                let original_name = field.file_name().unwrap_or("video").to_string();
                match field.bytes().await {
                    Ok(bytes) => {
                        video = Some((original_name, bytes));
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to read upload body");
                        return json_error(StatusCode::BAD_REQUEST, "Invalid upload");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "malformed multipart request");
                return json_error(StatusCode::BAD_REQUEST, "Invalid upload");
            }
        }
    }
    let Some((original_name, bytes)) = video else {
        return json_error(StatusCode::BAD_REQUEST, "Video file is required");
    };

    let filename = hashed_filename(&original_name);
    let upload_dir = &state.settings.files.upload_dir;
    if let Err(err) = tokio::fs::create_dir_all(upload_dir).await {
        tracing::error!(%err, "failed to create upload directory");
        return internal_error();
    }

    // Record first, then write: a failed insert must not leave an orphaned
    // file, and a failed write rolls the record back.
    let entry = match storage::create_video(&state.db, project_id, &filename).await {
        Ok(entry) => entry,
        Err(err) => {
            tracing::error!(%err, "video record creation failed");
            return internal_error();
        }
    };
    if let Err(err) = tokio::fs::write(upload_dir.join(&filename), &bytes).await {
        tracing::error!(%err, "failed to store upload");
        if let Err(err) = storage::delete_video(&state.db, &entry.id).await {
            tracing::error!(%err, video_id = %entry.id, "failed to roll back video record");
        }
        return internal_error();
    }

    (
        StatusCode::CREATED,
        Json(json!({"message": "Video uploaded", "video_id": entry.id})),
    )
        .into_response()
}

async fn add_annotations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<i32>,
    Json(body): Json<Value>,
) -> Response {
    match storage::find_project(&state.db, project_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Project not found"),
        Err(err) => {
            tracing::error!(%err, "project lookup failed");
            return internal_error();
        }
    }

    let Some(entries) = body.get("annotations").and_then(|v| v.as_array()) else {
        return json_error(StatusCode::BAD_REQUEST, "Annotations are required");
    };
    // Validate the full batch before anything is written.
    let mut annotations = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<NewAnnotation>(entry.clone()) {
            Ok(annotation) => annotations.push(annotation),
            Err(err) => {
                tracing::warn!(%err, "rejected malformed annotation entry");
                return json_error(StatusCode::BAD_REQUEST, "Invalid annotation entry");
            }
        }
    }

    match storage::insert_annotations(&state.db, project_id, &annotations).await {
        Ok(_) => (
            StatusCode::CREATED,
            Json(json!({"message": "Annotations added"})),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%err, "annotation insert failed");
            internal_error()
        }
    }
}

async fn apply_annotations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(project_id): Path<i32>,
) -> Response {
    match storage::find_project(&state.db, project_id, &claims.sub).await {
        Ok(Some(_)) => {
            // Frame overlay rendering is not implemented; the route exists so
            // clients can schedule it.
            tracing::info!(project_id, "annotation processing scheduled");
            (
                StatusCode::ACCEPTED,
                Json(json!({"message": "Annotation processing scheduled"})),
            )
                .into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Project not found"),
        Err(err) => {
            tracing::error!(%err, "project lookup failed");
            internal_error()
        }
    }
}
