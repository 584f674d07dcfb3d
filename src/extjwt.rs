//! EXTJWT token signing.
//!
//! Tokens prove a user's nick and channel membership to third-party services
//! (the draft EXTJWT extension). They are plain HS256 JWTs assembled from
//! `hmac`/`sha2`/`base64` directly: header and claims are serialized,
//! URL-safe base64 encoded without padding, and signed over
//! `header.claims`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Tokens longer than this are delivered in chunks with a `*` continuation
/// marker, per the draft.
pub const MAX_TOKEN_CHUNK: usize = 200;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("claims are not serializable: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("invalid signing key")]
    Key,
}

/// Sign `claims` into a compact HS256 JWT.
pub fn sign_hs256(claims: &serde_json::Value, secret: &str) -> Result<String, SignError> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignError::Key)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Split a token into `MAX_TOKEN_CHUNK`-sized pieces. All but the last are
/// sent with the `*` continuation parameter.
pub fn chunk_token(token: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = token;
    while rest.len() > MAX_TOKEN_CHUNK {
        let (part, tail) = rest.split_at(MAX_TOKEN_CHUNK);
        parts.push(part);
        rest = tail;
    }
    parts.push(rest);
    parts
}
