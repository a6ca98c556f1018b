//! API credentials.

use std::fmt;
use zeroize::Zeroizing;

/// API key pair used for REST signing and the stream handshake.
///
/// The secret is zeroed on drop and never printed: `Debug` redacts it.
#[derive(Clone)]
pub struct Credential {
    key_id: String,
    secret: Zeroizing<Vec<u8>>,
}

impl Credential {
    pub fn new(key_id: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: Zeroizing::new(secret.as_ref().to_vec()),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new("key-1", "super-secret");
        let printed = format!("{cred:?}");
        assert!(printed.contains("key-1"));
        assert!(!printed.contains("super-secret"));
    }
}
