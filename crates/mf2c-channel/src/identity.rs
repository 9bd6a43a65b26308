// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent identity: RSA key-pair, device id, sign / verify / encrypt helpers.
//!
//! # Architecture
//!
//! ```text
//! IDENTITY (static OnceLock, process-wide)
//! +-- private_key: RsaPrivateKey (2048 bit)
//! +-- signing_key: SigningKey<Sha256>   (PKCS#1 v1.5, SHA256withRSA)
//! +-- public_key:  RsaPublicKey
//! +-- public_key_pem: String            (X.509 SubjectPublicKeyInfo, PEM)
//! +-- device_id: [u8; 32]               (random)
//! ```
//!
//! The singleton is created on first use and is read-only afterwards, so no
//! locking is needed once [`Identity::get_instance`] has returned. Peers in
//! tests can build independent identities with [`Identity::generate`].
//!
//! Encryption is RSA PKCS#1 v1.5 (ECB), which limits a single plaintext to
//! [`MAX_PLAINTEXT_LEN`] bytes with a 2048-bit key.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::error::IdentityError;

/// RSA modulus size in bits.
pub const KEY_BITS: usize = 2048;

/// Length of the random device id.
pub const DEVICE_ID_LEN: usize = 32;

/// Largest plaintext a single PKCS#1 v1.5 block can carry (k - 11).
pub const MAX_PLAINTEXT_LEN: usize = KEY_BITS / 8 - 11;

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

static IDENTITY: OnceLock<Result<Identity, IdentityError>> = OnceLock::new();

/// Key material and device id of this agent.
pub struct Identity {
    private_key: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
    public_key: RsaPublicKey,
    public_key_pem: String,
    device_id: [u8; DEVICE_ID_LEN],
}

impl Identity {
    /// Process-wide identity, generated on first call.
    ///
    /// Generation failure is sticky: every later call returns the same error.
    pub fn get_instance() -> Result<&'static Identity, IdentityError> {
        IDENTITY
            .get_or_init(|| {
                let identity = Identity::generate();
                match &identity {
                    Ok(id) => tracing::info!("Identity ready, device id {}", id.device_id_hex()),
                    Err(e) => tracing::error!("Identity generation failed: {}", e),
                }
                identity
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Generate a fresh, independent identity.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| IdentityError::Init(format!("key-pair generation: {}", e)))?;
        let public_key = private_key.to_public_key();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Init(format!("public key encoding: {}", e)))?;

        let mut device_id = [0u8; DEVICE_ID_LEN];
        rng.try_fill_bytes(&mut device_id)
            .map_err(|e| IdentityError::Init(format!("device id: {}", e)))?;

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key.clone()),
            private_key,
            public_key,
            public_key_pem,
            device_id,
        })
    }

    pub fn device_id(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.device_id
    }

    /// Device id as lowercase hex.
    pub fn device_id_hex(&self) -> String {
        self.device_id.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Public key as PEM (`-----BEGIN PUBLIC KEY-----` ...).
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// SHA256withRSA signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| IdentityError::Sign(e.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Signature over `data`, base64-encoded for the JSON envelope.
    pub fn sign_as_string(&self, data: &[u8]) -> Result<String, IdentityError> {
        self.sign(data).map(|sig| BASE64.encode(sig))
    }

    /// Decrypt a PKCS#1 v1.5 block addressed to this identity.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, IdentityError> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| IdentityError::Crypto(format!("decrypt: {}", e)))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("device_id", &self.device_id_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a SHA256withRSA signature. Malformed signatures verify as false.
pub fn verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .is_ok()
}

/// Encrypt `data` for the holder of `key` (PKCS#1 v1.5).
pub fn encrypt_for(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, IdentityError> {
    if data.len() > MAX_PLAINTEXT_LEN {
        return Err(IdentityError::Crypto(format!(
            "plaintext is {} bytes, limit is {}",
            data.len(),
            MAX_PLAINTEXT_LEN
        )));
    }
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| IdentityError::Crypto(format!("encrypt: {}", e)))
}

/// Parse a PEM public key. Markers and line breaks are stripped before the
/// base64 body is decoded as X.509 SubjectPublicKeyInfo, so a bare base64
/// body is accepted too.
pub fn parse_public_key(text: &str) -> Result<RsaPublicKey, IdentityError> {
    let body: String = text
        .replace(PEM_HEADER, "")
        .replace(PEM_FOOTER, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let der = BASE64
        .decode(body.as_bytes())
        .map_err(|e| IdentityError::Crypto(format!("public key base64: {}", e)))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| IdentityError::Crypto(format!("public key DER: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_is_stable() {
        let a = Identity::get_instance().expect("identity");
        let b = Identity::get_instance().expect("identity");
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.device_id().len(), DEVICE_ID_LEN);
    }

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::get_instance().expect("identity");
        let sig = id.sign(b"hello").expect("sign");
        assert!(verify(id.public_key(), b"hello", &sig));
        assert!(!verify(id.public_key(), b"hellO", &sig));
        assert!(!verify(id.public_key(), b"hello", &sig[1..]));
    }

    #[test]
    fn test_sign_as_string_is_base64() {
        let id = Identity::get_instance().expect("identity");
        let text = id.sign_as_string(b"payload").expect("sign");
        let raw = BASE64.decode(text).expect("base64");
        assert_eq!(raw.len(), KEY_BITS / 8);
    }

    #[test]
    fn test_pem_round_trip() {
        let id = Identity::get_instance().expect("identity");
        assert!(id.public_key_pem().starts_with(PEM_HEADER));
        let parsed = parse_public_key(id.public_key_pem()).expect("parse");
        assert_eq!(&parsed, id.public_key());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_public_key("-----BEGIN PUBLIC KEY-----\n!!!\n").is_err());
        assert!(parse_public_key("aGVsbG8=").is_err());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let id = Identity::get_instance().expect("identity");
        let ct = encrypt_for(id.public_key(), b"secret").expect("encrypt");
        assert_ne!(ct, b"secret");
        assert_eq!(id.decrypt(&ct).expect("decrypt"), b"secret");
    }

    #[test]
    fn test_encrypt_rejects_oversized_plaintext() {
        let id = Identity::get_instance().expect("identity");
        let data = vec![b'x'; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            encrypt_for(id.public_key(), &data),
            Err(IdentityError::Crypto(_))
        ));
        let data = vec![b'x'; MAX_PLAINTEXT_LEN];
        assert!(encrypt_for(id.public_key(), &data).is_ok());
    }
}
