//! In-memory holder of the current access token.
//!
//! # Design
//! `TokenState` is constructed once and shared by `Arc` with every component
//! that needs it. Reads are lock-free (`ArcSwapOption`), so the request path
//! never waits on a writer, and a write is visible to the very next read.
//! Nothing here touches disk.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use secrecy::{ExposeSecret, SecretString};

/// A bearer credential. `Debug` output is redacted.
#[derive(Clone)]
pub struct AccessToken(Arc<SecretString>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.expose())
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for AccessToken {}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl From<&str> for AccessToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Default)]
pub struct TokenState {
    current: ArcSwapOption<SecretString>,
}

impl TokenState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: AccessToken) {
        self.current.store(Some(token.0));
    }

    pub fn clear_token(&self) {
        self.current.store(None);
    }

    pub fn current_token(&self) -> Option<AccessToken> {
        self.current.load_full().map(AccessToken)
    }

    pub fn has_token(&self) -> bool {
        self.current.load().is_some()
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("has_token", &self.has_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let state = TokenState::new();
        assert!(state.current_token().is_none());
        assert!(!state.has_token());
    }

    #[test]
    fn set_then_clear() {
        let state = TokenState::new();
        state.set_token(AccessToken::new("t1"));
        assert_eq!(state.current_token(), Some(AccessToken::new("t1")));

        state.set_token(AccessToken::new("t2"));
        assert_eq!(state.current_token().unwrap().expose(), "t2");

        state.clear_token();
        assert!(state.current_token().is_none());
    }

    #[test]
    fn bearer_header_value() {
        assert_eq!(AccessToken::new("abc").bearer(), "Bearer abc");
    }

    #[test]
    fn debug_output_is_redacted() {
        let token = AccessToken::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
        let state = TokenState::new();
        state.set_token(token);
        assert!(!format!("{state:?}").contains("super-secret"));
    }
}
