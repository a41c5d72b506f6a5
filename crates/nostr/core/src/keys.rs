//! Minimal key handling: enough to hold an identity and sign with it.

use crate::crypto::{CryptoGateway, Secp256k1Gateway};
use crate::nip01::{Nip01Error, decode_32};

/// A secret key and its x-only public key (hex).
#[derive(Clone, PartialEq, Eq)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let gateway = Secp256k1Gateway::new();
        loop {
            let mut secret_key = [0u8; 32];
            gateway.random_bytes(&mut secret_key);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(public_key) = gateway.public_key(&secret_key) {
                return Self {
                    secret_key,
                    public_key: hex::encode(public_key),
                };
            }
        }
    }

    pub fn from_secret_key(secret_key: [u8; 32]) -> Result<Self, Nip01Error> {
        let public_key = Secp256k1Gateway::new().public_key(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key: hex::encode(public_key),
        })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, Nip01Error> {
        Self::from_secret_key(decode_32(secret_hex.trim())?)
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
