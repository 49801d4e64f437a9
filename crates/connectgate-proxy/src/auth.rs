//! `Proxy-Authorization: Basic` validation.
//!
//! With no credentials configured the proxy runs in open mode and every
//! request is authorized.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Username/password pair clients must present.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Checks proxy credentials against the configured pair.
#[derive(Debug, Clone)]
pub struct Authenticator {
    credentials: Option<Credentials>,
    realm: String,
}

impl Authenticator {
    pub fn new(credentials: Option<Credentials>, realm: impl Into<String>) -> Self {
        Self {
            credentials,
            realm: realm.into(),
        }
    }

    /// Returns `true` when credentials are configured.
    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Realm advertised in the `Proxy-Authenticate` challenge.
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Decide whether a request carrying `header` (the raw
    /// `Proxy-Authorization` value, if any) is authorized.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.credentials else {
            return true;
        };
        let Some((username, password)) = header.and_then(decode_basic) else {
            return false;
        };
        // Evaluate both comparisons so timing does not reveal which field differed.
        let user_ok = constant_time_eq(username.as_bytes(), expected.username.as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), expected.password.as_bytes());
        user_ok & pass_ok
    }
}

/// Decode `Basic <base64(user:pass)>` into its two halves.
///
/// The scheme is matched case-insensitively; the decoded payload is split on
/// the first colon, so passwords may themselves contain colons.
fn decode_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
