//! Proxy session cookies, CSRF tokens and the short-lived error-message cookie

use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SESSION_COOKIE: &str = "agentgate_user";
pub const CSRF_COOKIE: &str = "agentgate_csrf";
pub const ERROR_COOKIE: &str = "error_msg";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username the session is bound to
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub expiry_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: random_token(48),
            expiry_hours: 12,
        }
    }
}

/// Issues and validates the signed session cookie binding a browser to a
/// username. Possession of a valid cookie is the only authentication state
/// the proxy keeps.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<SessionConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
        }
    }

    /// Create the session cookie value for a freshly authenticated user
    pub fn create_session_cookie(
        &self,
        username: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            exp: (now + Duration::hours(self.config.expiry_hours)).timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)?;

        Ok(format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            token,
            self.config.expiry_hours * 3600
        ))
    }

    /// Cookie that clears the session immediately
    pub fn clear_session_cookie(&self) -> String {
        format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", SESSION_COOKIE)
    }

    /// Username bound to the request's session cookie, if any is valid
    pub fn authenticated_user(&self, cookie_header: Option<&str>) -> Option<String> {
        let token = cookie_value(cookie_header?, SESSION_COOKIE)?;
        let data = decode::<Claims>(&token, &self.decoding_key, &Validation::default()).ok()?;
        Some(data.claims.sub)
    }
}

/// URL-safe random token for CSRF double-submit cookies
pub fn random_token(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Non-HttpOnly so the login form can echo it back as a field
pub fn csrf_cookie(token: &str) -> String {
    format!("{}={}; Path=/; SameSite=Lax", CSRF_COOKIE, token)
}

/// Short-lived cookie carrying a URL-escaped user-visible error message
pub fn error_cookie(message: &str) -> String {
    format!(
        "{}={}; Path=/; Max-Age=30",
        ERROR_COOKIE,
        urlencoding::encode(message)
    )
}

pub fn clear_error_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0", ERROR_COOKIE)
}

/// Extract one cookie's value from a Cookie header
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    for cookie in cookie_header.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig {
            secret: "test-secret-for-session-cookies".to_string(),
            expiry_hours: 12,
        })
    }

    #[test]
    fn test_session_round_trip() {
        let sessions = manager();
        let cookie = sessions.create_session_cookie("alice").unwrap();

        // Simulate the browser sending the Set-Cookie value back
        let pair = cookie.split(';').next().unwrap();
        assert_eq!(sessions.authenticated_user(Some(pair)), Some("alice".to_string()));
    }

    #[test]
    fn test_absent_or_garbage_cookie() {
        let sessions = manager();
        assert_eq!(sessions.authenticated_user(None), None);
        assert_eq!(
            sessions.authenticated_user(Some("agentgate_user=not.a.jwt")),
            None
        );
        assert_eq!(sessions.authenticated_user(Some("other=value")), None);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = manager();
        let b = SessionManager::new(SessionConfig {
            secret: "different-secret".to_string(),
            expiry_hours: 12,
        });

        let cookie = a.create_session_cookie("alice").unwrap();
        let pair = cookie.split(';').next().unwrap().to_string();
        assert_eq!(b.authenticated_user(Some(&pair)), None);
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let sessions = manager();
        let cookie = sessions.clear_session_cookie();
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.starts_with("agentgate_user="));
    }

    #[test]
    fn test_cookie_value_parsing() {
        assert_eq!(
            cookie_value("a=1; agentgate_csrf=tok; b=2", CSRF_COOKIE),
            Some("tok".to_string())
        );
        assert_eq!(cookie_value("agentgate_csrf=", CSRF_COOKIE), None);
        assert_eq!(cookie_value("a=1", CSRF_COOKIE), None);
        // A name that is a prefix of another must not match
        assert_eq!(cookie_value("agentgate_csrf_x=1", CSRF_COOKIE), None);
    }

    #[test]
    fn test_error_cookie_is_url_escaped() {
        let cookie = error_cookie("Invalid credentials!");
        assert!(cookie.contains("Invalid%20credentials%21"));
    }

    #[test]
    fn test_random_tokens_differ() {
        assert_ne!(random_token(32), random_token(32));
    }
}
