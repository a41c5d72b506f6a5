//! NIP-04: Encrypted Direct Message.
//!
//! Payload: `base64(aes_256_cbc(ecdh_x(sk, pk), iv, plaintext)) + "?iv=" + base64(iv)`.

use crate::crypto::{CryptoError, CryptoGateway};
use crate::nip01::decode_32;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Errors that can occur during NIP-04 operations.
#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypt `plaintext` for `recipient_pubkey` (hex, x-only).
pub fn encrypt_with(
    gateway: &dyn CryptoGateway,
    secret_key: &[u8; 32],
    recipient_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let pubkey =
        decode_32(recipient_pubkey).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))?;
    let key = gateway.ecdh(secret_key, &pubkey)?;

    let mut iv = [0u8; 16];
    gateway.random_bytes(&mut iv);

    let ciphertext = gateway.sym_encrypt(&key, &iv, plaintext.as_bytes())?;
    Ok(format!(
        "{}?iv={}",
        STANDARD.encode(ciphertext),
        STANDARD.encode(iv)
    ))
}

/// Decrypt a payload sent by (or to) `counterpart_pubkey`.
pub fn decrypt_with(
    gateway: &dyn CryptoGateway,
    secret_key: &[u8; 32],
    counterpart_pubkey: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ciphertext_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::InvalidPayload("missing iv".to_string()))?;

    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("ciphertext: {e}")))?;
    let iv_bytes = STANDARD
        .decode(iv_b64)
        .map_err(|e| Nip04Error::InvalidPayload(format!("iv: {e}")))?;
    let iv = <[u8; 16]>::try_from(iv_bytes.as_slice())
        .map_err(|_| Nip04Error::InvalidPayload(format!("iv length {}", iv_bytes.len())))?;

    let pubkey =
        decode_32(counterpart_pubkey).map_err(|e| Nip04Error::InvalidPublicKey(e.to_string()))?;
    let key = gateway.ecdh(secret_key, &pubkey)?;

    let plaintext = gateway.sym_decrypt(&key, &iv, &ciphertext)?;
    Ok(String::from_utf8(plaintext)?)
}

#[cfg(feature = "full")]
pub fn encrypt(
    secret_key: &[u8; 32],
    recipient_pubkey: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    encrypt_with(
        &crate::crypto::Secp256k1Gateway::new(),
        secret_key,
        recipient_pubkey,
        plaintext,
    )
}

#[cfg(feature = "full")]
pub fn decrypt(
    secret_key: &[u8; 32],
    counterpart_pubkey: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    decrypt_with(
        &crate::crypto::Secp256k1Gateway::new(),
        secret_key,
        counterpart_pubkey,
        payload,
    )
}

#[cfg(all(test, feature = "full"))]
mod tests {
    use super::*;
    use crate::Keys;

    #[test]
    fn test_both_sides_can_decrypt() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let payload = encrypt(alice.secret_key(), bob.public_key(), "hi bob").unwrap();
        assert!(payload.contains("?iv="));

        assert_eq!(
            decrypt(bob.secret_key(), alice.public_key(), &payload).unwrap(),
            "hi bob"
        );
        // The sender can read their own outgoing copy.
        assert_eq!(
            decrypt(alice.secret_key(), bob.public_key(), &payload).unwrap(),
            "hi bob"
        );
    }

    #[test]
    fn test_third_party_cannot_read() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let payload = encrypt(alice.secret_key(), bob.public_key(), "secret").unwrap();
        match decrypt(eve.secret_key(), alice.public_key(), &payload) {
            Ok(text) => assert_ne!(text, "secret"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        assert!(matches!(
            decrypt(alice.secret_key(), bob.public_key(), "no-iv-here"),
            Err(Nip04Error::InvalidPayload(_))
        ));
        assert!(matches!(
            decrypt(alice.secret_key(), bob.public_key(), "!!!?iv=AAAA"),
            Err(Nip04Error::InvalidPayload(_))
        ));
        assert!(matches!(
            encrypt(alice.secret_key(), "xyz", "hi"),
            Err(Nip04Error::InvalidPublicKey(_))
        ));
    }
}
