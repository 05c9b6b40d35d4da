//! Session cookie codec.
//!
//! Parses incoming `Cookie` headers, renders `Set-Cookie` values for the
//! session id, and optionally signs the id with HMAC-SHA256 so a client
//! cannot forge one.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::time::{Duration as CookieDuration, OffsetDateTime};
use cookie::Cookie;
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, COOKIE};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix marking a signed cookie value.
const SIGNED_PREFIX: &str = "s:";

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl From<SameSite> for cookie::SameSite {
    fn from(value: SameSite) -> Self {
        match value {
            SameSite::Strict => cookie::SameSite::Strict,
            SameSite::Lax => cookie::SameSite::Lax,
            SameSite::None => cookie::SameSite::None,
        }
    }
}

/// Attributes attached to the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CookieOptions {
    /// Lifetime in seconds. `None` issues a browser-session cookie.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

impl CookieOptions {
    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Check the option combination once, at setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidCookie(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.path.chars().any(|c| c == ';' || c.is_control()) {
            return Err(ConfigError::InvalidCookie(format!(
                "path contains forbidden characters: {:?}",
                self.path
            )));
        }
        if let Some(domain) = &self.domain {
            if domain.is_empty()
                || domain
                    .chars()
                    .any(|c| c == ';' || c.is_whitespace() || c.is_control())
            {
                return Err(ConfigError::InvalidCookie(format!(
                    "invalid domain: {:?}",
                    domain
                )));
            }
        }
        if let Some(max_age) = self.max_age {
            if i64::try_from(max_age).is_err() {
                return Err(ConfigError::InvalidCookie(format!(
                    "maxAge out of range: {}",
                    max_age
                )));
            }
        }
        if self.same_site == SameSite::None && !self.secure {
            return Err(ConfigError::InvalidCookie(
                "sameSite=none requires secure=true".to_string(),
            ));
        }
        Ok(())
    }

    fn max_age_duration(&self) -> Option<CookieDuration> {
        self.max_age
            .map(|secs| CookieDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }

    fn apply<'c>(&self, mut builder: cookie::CookieBuilder<'c>) -> cookie::CookieBuilder<'c> {
        builder = builder
            .path(self.path.clone())
            .http_only(self.http_only)
            .secure(self.secure)
            .same_site(self.same_site.into());
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder
    }
}

/// Parse a `Cookie` header into name/value pairs.
///
/// Never fails: malformed pairs are skipped, and the first occurrence of a
/// name wins.
pub fn parse(header: &str) -> HashMap<String, String> {
    let mut jar = HashMap::new();
    for cookie in Cookie::split_parse(header).flatten() {
        jar.entry(cookie.name().to_string())
            .or_insert_with(|| cookie.value().to_string());
    }
    jar
}

/// Parse every `Cookie` header on a request.
pub fn parse_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut jar = HashMap::new();
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for (name, value) in parse(value) {
            jar.entry(name).or_insert(value);
        }
    }
    jar
}

/// Render a `Set-Cookie` value carrying `value`.
pub fn serialize(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut builder = options.apply(Cookie::build((name.to_string(), value.to_string())));
    if let Some(max_age) = options.max_age_duration() {
        builder = builder.max_age(max_age);
    }
    builder.build().to_string()
}

/// Render a `Set-Cookie` value that makes the client drop the cookie.
pub fn serialize_clear(name: &str, options: &CookieOptions) -> String {
    options
        .apply(Cookie::build((name.to_string(), String::new())))
        .max_age(CookieDuration::ZERO)
        .expires(OffsetDateTime::UNIX_EPOCH)
        .build()
        .to_string()
}

/// Cookie names must be RFC 6265 tokens.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    const SEPARATORS: &[char] = &[
        '(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '=', '{', '}',
    ];
    if name.is_empty() {
        return Err(ConfigError::InvalidCookie("cookie name must not be empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_graphic() && !SEPARATORS.contains(&c))
    {
        return Err(ConfigError::InvalidCookie(format!(
            "cookie name is not a valid token: {:?}",
            name
        )));
    }
    Ok(())
}

/// Whether `value` only uses RFC 6265 cookie-octets.
pub fn is_valid_value(value: &str) -> bool {
    value.bytes().all(|b| {
        matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
    })
}

/// Signs and verifies session ids carried in the cookie.
///
/// The first secret signs; every secret is accepted when verifying, so old
/// secrets can be kept around during rotation. With no secrets the id is
/// carried as-is.
#[derive(Clone, Default)]
pub struct CookieSigner {
    keys: Vec<HmacSha256>,
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl CookieSigner {
    pub fn new<I, S>(secrets: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = Vec::new();
        for secret in secrets {
            let secret = secret.as_ref();
            if secret.is_empty() {
                return Err(ConfigError::InvalidCookie("secret must not be empty".to_string()));
            }
            let key = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| ConfigError::InvalidCookie(format!("unusable secret: {}", e)))?;
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn is_signing(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Produce the cookie value for `id`.
    pub fn sign(&self, id: &str) -> String {
        let Some(key) = self.keys.first() else {
            return id.to_string();
        };
        let mut mac = key.clone();
        mac.update(id.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{SIGNED_PREFIX}{id}.{signature}")
    }

    /// Recover the id from a cookie value, or `None` if it fails verification.
    pub fn unsign(&self, value: &str) -> Option<String> {
        if self.keys.is_empty() {
            return (!value.is_empty()).then(|| value.to_string());
        }
        let (id, signature) = value.strip_prefix(SIGNED_PREFIX)?.rsplit_once('.')?;
        if id.is_empty() {
            return None;
        }
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        self.keys
            .iter()
            .any(|key| {
                let mut mac = key.clone();
                mac.update(id.as_bytes());
                mac.verify_slice(&signature).is_ok()
            })
            .then(|| id.to_string())
    }
}
