#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use framemark::idp::{AuthTokens, IdentityProvider, IdpError, SignUpOutcome};
use framemark::jwks::{JwkKey, JwksFetcher, KeyResolutionError, KeyResolver};
use framemark::settings::{Database as DbCfg, Settings};
use framemark::storage;
use framemark::verifier::TokenVerifier;
use framemark::web::{self, AppState};
use http_body_util::BodyExt;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, RS256};
use josekit::jwt::{self, JwtPayload};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{NamedTempFile, TempDir};
use tower::ServiceExt;

pub const TEST_ISSUER: &str = "https://cognito-idp.eu-west-1.amazonaws.com/eu-west-1_TestPool";
pub const TEST_CLIENT_ID: &str = "test-client-id";
pub const TEST_CONFIRM_CODE: &str = "123456";

/// Test database with automatic cleanup
pub struct TestDb {
    pub connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = storage::init(&DbCfg { url })
            .await
            .expect("Failed to init test database");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }
}

/// Mints RS256 tokens and publishes the matching public key material,
/// standing in for the pool's signing keys.
pub struct TokenMint {
    jwk: Jwk,
    kid: String,
}

impl TokenMint {
    pub fn new(kid: &str) -> Self {
        let mut jwk = Jwk::generate_rsa_key(2048).expect("Failed to generate RSA key");
        jwk.set_key_id(kid);
        jwk.set_algorithm("RS256");
        jwk.set_key_use("sig");
        Self {
            jwk,
            kid: kid.to_string(),
        }
    }

    /// Public key in the form the resolver caches.
    pub fn jwk_key(&self) -> JwkKey {
        let param = |name: &str| {
            self.jwk
                .parameter(name)
                .and_then(|v| v.as_str())
                .expect("missing RSA parameter")
                .to_string()
        };
        JwkKey {
            kid: self.kid.clone(),
            n: param("n"),
            e: param("e"),
        }
    }

    pub fn sign(&self, claims: Value) -> String {
        let map = claims.as_object().expect("claims must be an object").clone();
        let payload = JwtPayload::from_map(map).expect("invalid claims");
        let signer = RS256
            .signer_from_jwk(&self.jwk)
            .expect("Failed to build signer");
        let mut header = JwsHeader::new();
        header.set_key_id(&self.kid);
        jwt::encode_with_signer(&payload, &header, &signer).expect("Failed to sign token")
    }

    /// Sign with a header that carries no kid at all. The signer copies the
    /// jwk's key id into the header, so it is stripped from the key first.
    pub fn sign_without_kid(&self, claims: Value) -> String {
        let map = claims.as_object().expect("claims must be an object").clone();
        let payload = JwtPayload::from_map(map).expect("invalid claims");
        let mut jwk = self.jwk.clone();
        jwk.set_parameter("kid", None).expect("Failed to strip kid");
        let signer = RS256
            .signer_from_jwk(&jwk)
            .expect("Failed to build signer");
        let header = JwsHeader::new();
        jwt::encode_with_signer(&payload, &header, &signer).expect("Failed to sign token")
    }

    /// ID-token shaped claims: audience set to the app client id.
    pub fn id_token(&self, sub: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        self.sign(json!({
            "sub": sub,
            "iss": TEST_ISSUER,
            "aud": TEST_CLIENT_ID,
            "exp": now + exp_offset_secs,
            "iat": now,
            "email": format!("{sub}@example.com"),
            "token_use": "id",
        }))
    }

    /// Access-token shaped claims: no audience, as the provider emits them.
    pub fn access_token(&self, sub: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        self.sign(json!({
            "sub": sub,
            "iss": TEST_ISSUER,
            "exp": now + exp_offset_secs,
            "iat": now,
            "token_use": "access",
        }))
    }
}

/// In-memory JWKS source with a swappable key set and a fetch counter.
pub struct FakeJwksFetcher {
    keys: Mutex<Vec<JwkKey>>,
    calls: AtomicUsize,
}

impl FakeJwksFetcher {
    pub fn new(keys: Vec<JwkKey>) -> Self {
        Self {
            keys: Mutex::new(keys),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_keys(&self, keys: Vec<JwkKey>) {
        *self.keys.lock().unwrap() = keys;
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksFetcher for FakeJwksFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<JwkKey>, KeyResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys.lock().unwrap().clone())
    }
}

pub fn verifier_for(fetcher: Arc<dyn JwksFetcher>) -> TokenVerifier {
    let resolver = KeyResolver::with_fetcher(format!("{TEST_ISSUER}/.well-known/jwks.json"), fetcher);
    TokenVerifier::new(resolver, TEST_ISSUER.to_string(), TEST_CLIENT_ID.to_string())
}

struct FakeUser {
    password: String,
    confirmed: bool,
}

#[derive(Default)]
struct FakeIdpState {
    users: HashMap<String, FakeUser>,
    sign_up_calls: usize,
    confirm_calls: usize,
    login_calls: usize,
    refresh_calls: usize,
}

/// In-memory identity provider. Confirmation codes are always
/// `TEST_CONFIRM_CODE`; successful logins hand out the preset token set.
pub struct FakeIdp {
    state: Mutex<FakeIdpState>,
    tokens: AuthTokens,
}

impl FakeIdp {
    pub fn new() -> Self {
        Self::with_tokens(AuthTokens {
            id_token: "fake-id-token".to_string(),
            access_token: "fake-access-token".to_string(),
            refresh_token: "fake-refresh-token".to_string(),
        })
    }

    pub fn with_tokens(tokens: AuthTokens) -> Self {
        Self {
            state: Mutex::new(FakeIdpState::default()),
            tokens,
        }
    }

    pub fn sign_up_calls(&self) -> usize {
        self.state.lock().unwrap().sign_up_calls
    }

    pub fn login_calls(&self) -> usize {
        self.state.lock().unwrap().login_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }
}

#[async_trait]
impl IdentityProvider for FakeIdp {
    async fn sign_up(
        &self,
        username: &str,
        password: &str,
        _email: &str,
    ) -> Result<SignUpOutcome, IdpError> {
        let mut state = self.state.lock().unwrap();
        state.sign_up_calls += 1;
        if state.users.contains_key(username) {
            return Err(IdpError::UsernameExists);
        }
        state.users.insert(
            username.to_string(),
            FakeUser {
                password: password.to_string(),
                confirmed: false,
            },
        );
        Ok(SignUpOutcome {
            user_sub: format!("sub-{username}"),
            user_confirmed: false,
        })
    }

    async fn confirm_sign_up(&self, username: &str, code: &str) -> Result<(), IdpError> {
        let mut state = self.state.lock().unwrap();
        state.confirm_calls += 1;
        let Some(user) = state.users.get_mut(username) else {
            return Err(IdpError::NotAuthorized);
        };
        if code != TEST_CONFIRM_CODE {
            return Err(IdpError::CodeMismatch);
        }
        user.confirmed = true;
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthTokens, IdpError> {
        let mut state = self.state.lock().unwrap();
        state.login_calls += 1;
        match state.users.get(username) {
            Some(user) if user.confirmed && user.password == password => Ok(self.tokens.clone()),
            _ => Err(IdpError::NotAuthorized),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, IdpError> {
        let mut state = self.state.lock().unwrap();
        state.refresh_calls += 1;
        if refresh_token == self.tokens.refresh_token {
            Ok("refreshed-access-token".to_string())
        } else {
            Err(IdpError::NotAuthorized)
        }
    }
}

/// App under test, with its temp directories kept alive.
pub struct TestApp {
    pub router: Router,
    pub upload_dir: std::path::PathBuf,
    _files: TempDir,
}

pub fn test_app(
    db: &TestDb,
    verifier: TokenVerifier,
    idp: Arc<dyn IdentityProvider>,
) -> TestApp {
    let files = TempDir::new().expect("Failed to create temp dir");
    let mut settings = Settings::default();
    settings.files.static_dir = files.path().join("static");
    settings.files.template_dir = files.path().join("templates");
    settings.files.upload_dir = files.path().join("uploads");
    let upload_dir = settings.files.upload_dir.clone();

    let router = web::router(AppState {
        settings: Arc::new(settings),
        db: db.connection.clone(),
        verifier,
        idp,
    });

    TestApp {
        router,
        upload_dir,
        _files: files,
    }
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response {
    request_json(app, "POST", uri, Some(body), None).await
}

pub async fn request_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    cookie: Option<&str>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("Failed to build request");

    app.clone()
        .oneshot(request)
        .await
        .expect("Request infallible")
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("Body was not JSON")
}

pub fn set_cookie_headers(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().expect("Cookie not UTF-8").to_string())
        .collect()
}

/// Build a multipart request body with a single file field.
pub fn multipart_body(field: &str, filename: &str, data: &[u8]) -> (String, Vec<u8>) {
    let boundary = "framemark-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}
