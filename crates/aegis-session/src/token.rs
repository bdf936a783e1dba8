//! Bearer token storage.
//!
//! Written only by the session state machine; read by the HTTP client on
//! every attempt through `CredentialSource`.

use aegis_http::CredentialSource;
use parking_lot::RwLock;
use zeroize::Zeroizing;

/// Current bearer token, zeroized on drop or replacement.
#[derive(Default)]
pub struct TokenCell {
    token: RwLock<Option<Zeroizing<String>>>,
}

impl TokenCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.token.read().is_some()
    }

    pub(crate) fn set(&self, token: Zeroizing<String>) {
        *self.token.write() = Some(token);
    }

    pub(crate) fn take(&self) -> Option<Zeroizing<String>> {
        self.token.write().take()
    }

    pub(crate) fn clear(&self) {
        self.token.write().take();
    }
}

impl CredentialSource for TokenCell {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        self.token.read().clone()
    }
}

impl std::fmt::Debug for TokenCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCell")
            .field("is_set", &self.is_set())
            .finish()
    }
}
