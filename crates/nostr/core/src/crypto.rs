//! Crypto gateway.
//!
//! Everything above this module consumes signing, hashing, key agreement and
//! symmetric encryption through [`CryptoGateway`], so the primitives can be
//! swapped (hardware signer, test double) without touching event handling.
//! [`Secp256k1Gateway`] is the default implementation, backed by
//! `bitcoin::secp256k1` for schnorr/ECDH and RustCrypto `aes` + `cbc`.

use thiserror::Error;

/// Errors that can occur inside a crypto gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Cryptographic primitives consumed by the event and DM layers.
pub trait CryptoGateway: Send + Sync {
    /// SHA-256 of `bytes`.
    fn hash(&self, bytes: &[u8]) -> [u8; 32];

    /// Schnorr signature of a 32-byte event id.
    fn sign(&self, id: &[u8; 32], secret_key: &[u8; 32]) -> Result<[u8; 64], CryptoError>;

    /// Verify a schnorr signature against an id and x-only public key.
    fn verify(&self, sig: &[u8; 64], id: &[u8; 32], pubkey: &[u8; 32]) -> bool;

    /// X-only public key for a secret key.
    fn public_key(&self, secret_key: &[u8; 32]) -> Result<[u8; 32], CryptoError>;

    /// X coordinate of the ECDH shared point between `secret_key` and the
    /// x-only `pubkey` (even parity assumed).
    fn ecdh(&self, secret_key: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32], CryptoError>;

    /// AES-256-CBC with PKCS#7 padding.
    fn sym_encrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 16],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of [`CryptoGateway::sym_encrypt`].
    fn sym_decrypt(
        &self,
        key: &[u8; 32],
        iv: &[u8; 16],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Fill `out` with random bytes.
    fn random_bytes(&self, out: &mut [u8]);
}

#[cfg(feature = "full")]
mod secp {
    use super::{CryptoError, CryptoGateway};
    use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
    use bitcoin::hashes::{Hash, sha256 as sha256_hash};
    use bitcoin::secp256k1::{
        All, Keypair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey, ecdh, schnorr,
    };
    use rand::RngCore;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
    type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

    /// Default gateway over secp256k1 and AES-256-CBC.
    pub struct Secp256k1Gateway {
        secp: Secp256k1<All>,
    }

    impl Secp256k1Gateway {
        pub fn new() -> Self {
            Self {
                secp: Secp256k1::new(),
            }
        }
    }

    impl Default for Secp256k1Gateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl std::fmt::Debug for Secp256k1Gateway {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Secp256k1Gateway").finish()
        }
    }

    /// SHA-256 digest.
    pub fn sha256(bytes: &[u8]) -> [u8; 32] {
        sha256_hash::Hash::hash(bytes).to_byte_array()
    }

    fn secret(secret_key: &[u8; 32]) -> Result<SecretKey, CryptoError> {
        SecretKey::from_slice(secret_key).map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))
    }

    impl CryptoGateway for Secp256k1Gateway {
        fn hash(&self, bytes: &[u8]) -> [u8; 32] {
            sha256(bytes)
        }

        fn sign(&self, id: &[u8; 32], secret_key: &[u8; 32]) -> Result<[u8; 64], CryptoError> {
            let sk = secret(secret_key)?;
            let keypair = Keypair::from_secret_key(&self.secp, &sk);
            let message = Message::from_digest(*id);
            let sig = self.secp.sign_schnorr_no_aux_rand(&message, &keypair);
            Ok(sig.serialize())
        }

        fn verify(&self, sig: &[u8; 64], id: &[u8; 32], pubkey: &[u8; 32]) -> bool {
            let Ok(sig) = schnorr::Signature::from_slice(sig) else {
                return false;
            };
            let Ok(pubkey) = XOnlyPublicKey::from_slice(pubkey) else {
                return false;
            };
            let message = Message::from_digest(*id);
            self.secp.verify_schnorr(&sig, &message, &pubkey).is_ok()
        }

        fn public_key(&self, secret_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
            let sk = secret(secret_key)?;
            let (xonly, _parity) = sk.x_only_public_key(&self.secp);
            Ok(xonly.serialize())
        }

        fn ecdh(&self, secret_key: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
            let sk = secret(secret_key)?;
            let mut compressed = [0u8; 33];
            compressed[0] = 0x02;
            compressed[1..].copy_from_slice(pubkey);
            let pk = PublicKey::from_slice(&compressed)
                .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

            let point = ecdh::shared_secret_point(&pk, &sk);
            let mut x = [0u8; 32];
            x.copy_from_slice(&point[..32]);
            Ok(x)
        }

        fn sym_encrypt(
            &self,
            key: &[u8; 32],
            iv: &[u8; 16],
            plaintext: &[u8],
        ) -> Result<Vec<u8>, CryptoError> {
            let cipher = Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }

        fn sym_decrypt(
            &self,
            key: &[u8; 32],
            iv: &[u8; 16],
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, CryptoError> {
            let cipher = Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| CryptoError::Decryption(e.to_string()))
        }

        fn random_bytes(&self, out: &mut [u8]) {
            rand::rng().fill_bytes(out);
        }
    }
}

#[cfg(feature = "full")]
pub use secp::{Secp256k1Gateway, sha256};
