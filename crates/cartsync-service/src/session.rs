//! Access to the credential used for cart requests.
//!
//! The cache and the mutation operations only ever need to know whether a bearer token is
//! available right now. Where the token comes from, and how a user logs in or is redirected to a
//! login page, is up to the embedding application.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens end up in `Debug` output of requests and errors, never print the secret.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(**)")
    }
}

/// The state of the current session, as seen by a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No credential was ever stored, or it was cleared.
    Missing,
    /// A credential exists, but its expiry has passed.
    Expired,
    /// A usable credential.
    Active(Token),
}

/// The collaborator that owns the current credential.
pub trait AuthSession: Send + Sync + 'static {
    /// Returns the current session state.
    fn state(&self) -> SessionState;

    /// Returns a usable token, if there is one.
    ///
    /// Both a missing and an expired credential yield `None`.
    fn token(&self) -> Option<Token> {
        match self.state() {
            SessionState::Active(token) => Some(token),
            SessionState::Missing | SessionState::Expired => None,
        }
    }

    /// Whether the session is currently authenticated.
    fn is_valid(&self) -> bool {
        self.token().is_some()
    }
}

#[derive(Debug)]
struct Credential {
    token: Token,
    expires_at: Option<SystemTime>,
}

/// An [`AuthSession`] backed by an in-memory credential with an optional expiry.
#[derive(Debug, Default)]
pub struct StoredSession {
    credential: RwLock<Option<Credential>>,
}

impl StoredSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session that is already logged in with a non-expiring token.
    pub fn with_token(token: impl Into<Arc<str>>) -> Self {
        let session = Self::new();
        session.store(Token::new(token), None);
        session
    }

    /// Stores a new credential, replacing any previous one.
    pub fn store(&self, token: Token, expires_at: Option<SystemTime>) {
        let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
        *credential = Some(Credential { token, expires_at });
    }

    /// Forgets the stored credential.
    pub fn clear(&self) {
        let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
        *credential = None;
    }
}

impl AuthSession for StoredSession {
    fn state(&self) -> SessionState {
        let credential = self.credential.read().unwrap_or_else(|e| e.into_inner());
        match credential.as_ref() {
            None => SessionState::Missing,
            Some(Credential {
                expires_at: Some(expires_at),
                ..
            }) if SystemTime::now() > *expires_at => SessionState::Expired,
            Some(credential) => SessionState::Active(credential.token.clone()),
        }
    }
}

impl<T: AuthSession> AuthSession for Arc<T> {
    fn state(&self) -> SessionState {
        (**self).state()
    }
}
