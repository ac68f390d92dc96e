//! Publisher authentication for FTL ingest.
//!
//! The server issues a random nonce; the client proves possession of the
//! channel's preshared key by returning HMAC-SHA-512(key, nonce). Lookup of
//! the key itself is delegated through [`IngestAuth`].

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;

/// Length of the server-issued challenge nonce.
pub const NONCE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown channel id")]
    UnknownChannel,

    #[error("stream key digest mismatch")]
    DigestMismatch,

    /// The backing store failed; distinct from a bad credential.
    #[error("authentication backend: {0}")]
    Backend(String),
}

/// Identity attached to an authenticated publish.
#[derive(Debug, Clone)]
pub struct ChannelAuth {
    pub channel_id: String,
    /// User-facing channel name; keys the channel map.
    pub name: String,
    pub user_id: String,
}

/// Credential check delegate for inbound publishers.
#[async_trait]
pub trait IngestAuth: Send + Sync {
    /// Verifies that `digest` is HMAC-SHA-512 of `nonce` under the channel's
    /// preshared key and returns the channel identity.
    async fn check_user(
        &self,
        channel_id: &str,
        nonce: &[u8],
        digest: &[u8],
    ) -> Result<ChannelAuth, AuthError>;
}

/// Generates a fresh challenge nonce from the OS CSPRNG.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Constant-time verification of an HMAC-SHA-512 digest.
#[must_use]
pub fn verify_digest(key: &[u8], nonce: &[u8], digest: &[u8]) -> bool {
    let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(key) else {
        return false;
    };
    mac.update(nonce);
    mac.verify_slice(digest).is_ok()
}

/// Computes HMAC-SHA-512 of `nonce` under `key`.
#[must_use]
pub fn compute_digest(key: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}
