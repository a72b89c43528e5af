//! Token verification.
//!
//! The upgrade handler treats verification as a pure contract: a token string
//! in, a user id out.  The production implementation checks an HMAC-SHA256
//! signature minted by the issuing backend; tests substitute their own
//! [`TokenVerifier`].

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
}

/// Validates an authentication token and yields the user identifier.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Verifier for `<user_id>.<hex hmac-sha256(secret, user_id)>` tokens.
pub struct HmacVerifier {
    secret: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for `user_id`.  Used by the token-issuing side and tests.
    pub fn sign(&self, user_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(user_id.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{user_id}.{signature}")
    }
}

impl TokenVerifier for HmacVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        // rsplit so user ids containing dots still verify.
        let (user_id, signature_hex) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if user_id.is_empty() {
            return Err(AuthError::Malformed);
        }
        let signature = hex::decode(signature_hex).map_err(|_| AuthError::Malformed)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Malformed)?;
        mac.update(user_id.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;
        Ok(user_id.to_owned())
    }
}
