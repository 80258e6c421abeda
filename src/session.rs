//! Cookie transport for the credential set. The server only ever sets and
//! clears these cookies; their lifetimes belong to the identity provider.

use axum::http::HeaderMap;

pub const ID_TOKEN_COOKIE: &str = "id_token";
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

/// The three bearer tokens carried by a client, any of which may be absent.
#[derive(Clone, Debug, Default)]
pub struct AuthCookies {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl AuthCookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cookies = Self::default();
        let Some(raw) = headers
            .get(axum::http::header::COOKIE)
            .and_then(|h| h.to_str().ok())
        else {
            return cookies;
        };

        for cookie in raw.split(';') {
            let cookie = cookie.trim();
            if let Some((name, value)) = cookie.split_once('=') {
                match name {
                    ID_TOKEN_COOKIE => cookies.id_token = Some(value.to_string()),
                    ACCESS_TOKEN_COOKIE => cookies.access_token = Some(value.to_string()),
                    REFRESH_TOKEN_COOKIE => cookies.refresh_token = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        cookies
    }
}

pub fn auth_cookie_header(name: &str, value: &str) -> String {
    format!("{name}={value}; HttpOnly; Secure; SameSite=Strict; Path=/")
}

pub fn clear_cookie_header(name: &str) -> String {
    format!("{name}=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0")
}
