//! Admin sessions.
//!
//! A session is a signed expiry, not a server-side record:
//! `admin_session={expires}.{hex hmac_sha256(secret, "admin:{expires}")}`. Logging out
//! clears the cookie; a copied token stays valid until it expires.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "admin_session";
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct SessionKeys {
    password: String,
    secret: String,
    secure_cookie: bool,
}

impl SessionKeys {
    pub fn new(password: String, secret: String, secure_cookie: bool) -> Self {
        Self {
            password,
            secret,
            secure_cookie,
        }
    }

    /// Constant-time comparison against the configured admin password.
    pub fn password_matches(&self, candidate: &str) -> bool {
        let expected = self.password.as_bytes();
        let candidate = candidate.as_bytes();
        // ct_eq on slices of unequal length returns false without comparing contents.
        expected.ct_eq(candidate).into()
    }

    pub fn issue(&self, now_secs: u64) -> String {
        let expires = now_secs.saturating_add(SESSION_TTL.as_secs());
        format!("{expires}.{}", self.sign(expires))
    }

    pub fn verify(&self, token: &str, now_secs: u64) -> bool {
        let Some((expires, signature)) = token.split_once('.') else {
            return false;
        };
        let Ok(expires) = expires.parse::<u64>() else {
            return false;
        };
        if expires <= now_secs {
            return false;
        }
        let expected = self.sign(expires);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }

    /// `Set-Cookie` value for a fresh session.
    pub fn login_cookie(&self, now_secs: u64) -> String {
        self.cookie(&self.issue(now_secs), SESSION_TTL.as_secs())
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn logout_cookie(&self) -> String {
        self.cookie("", 0)
    }

    fn cookie(&self, value: &str, max_age: u64) -> String {
        let mut cookie =
            format!("{COOKIE_NAME}={value}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}");
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn sign(&self, expires: u64) -> String {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(format!("admin:{expires}").as_bytes());
        format!("{:x}", mac.finalize().into_bytes())
    }
}

/// Value of the session cookie in a `Cookie` request header, if present.
pub fn session_cookie(header: &str) -> Option<&str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
