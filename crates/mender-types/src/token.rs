//! The opaque bearer credential cached by the authorization manager.

use serde::{Deserialize, Serialize};

/// The storage key the token is persisted under.
pub const AUTH_TOKEN_KEY: &str = "authtoken";

/// An opaque authorization token.
///
/// The core never inspects the bytes beyond comparing for emptiness; the
/// server defines what, if anything, they mean.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthToken(pub Vec<u8>);

impl AuthToken {
    /// The sentinel "no token" value.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Whether this is the sentinel "no token" value.
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a token from opaque server-issued bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Render as a bearer header value.
    pub fn as_bearer_header(&self) -> String {
        format!("Bearer {}", String::from_utf8_lossy(&self.0))
    }
}
