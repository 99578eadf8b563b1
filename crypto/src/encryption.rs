//! Hybrid encryption for sealed envelopes.
//!
//! Every call to [`encrypt`] draws a fresh random ChaCha20-Poly1305 key and
//! nonce for the payload. The symmetric key is then wrapped to the
//! recipient: an ephemeral X25519 secret is agreed with the recipient's
//! (Montgomery-converted) Ed25519 key, the shared secret is hashed into a
//! key-encryption key, and the symmetric key is sealed under it.
//!
//! Layouts:
//! - `encrypted_key`     = `ephemeral_public (32) || AEAD(kek, sym_key) (48)`
//! - `encrypted_payload` = `nonce (12) || AEAD(sym_key, plaintext)`
//!
//! The key-wrap nonce is all zeroes; the key-encryption key is unique per
//! ephemeral secret, so it is never reused.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use idnet_types::{PrivateKey, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use crate::hash::blake2b_256_multi;
use crate::keys::{ed25519_private_to_x25519, ed25519_public_to_x25519};
use crate::CryptoError;

const KEY_WRAP_DOMAIN: &[u8] = b"idnet-key-wrap-v1";
const NONCE_LEN: usize = 12;
const WRAPPED_KEY_LEN: usize = 32 + 32 + 16;

/// Output of [`encrypt`]: the wrapped single-use key and the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridCiphertext {
    pub encrypted_key: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

fn key_encryption_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    blake2b_256_multi(&[shared, ephemeral, recipient, KEY_WRAP_DOMAIN])
}

/// Encrypt `plaintext` for the holder of `recipient`'s private key.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<HybridCiphertext, CryptoError> {
    let recipient_x =
        ed25519_public_to_x25519(recipient.as_bytes()).ok_or(CryptoError::InvalidPublicKey)?;

    let mut sym_key = [0u8; 32];
    OsRng.fill_bytes(&mut sym_key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let payload_cipher =
        ChaCha20Poly1305::new_from_slice(&sym_key).map_err(|_| CryptoError::Encryption)?;
    let sealed = payload_cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut encrypted_payload = Vec::with_capacity(NONCE_LEN + sealed.len());
    encrypted_payload.extend_from_slice(&nonce_bytes);
    encrypted_payload.extend_from_slice(&sealed);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519Public::from(recipient_x));
    let kek = key_encryption_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient_x);

    let wrap_cipher = ChaCha20Poly1305::new_from_slice(&kek).map_err(|_| CryptoError::Encryption)?;
    let wrapped = wrap_cipher
        .encrypt(&Nonce::default(), &sym_key[..])
        .map_err(|_| CryptoError::Encryption)?;

    let mut encrypted_key = Vec::with_capacity(WRAPPED_KEY_LEN);
    encrypted_key.extend_from_slice(ephemeral_public.as_bytes());
    encrypted_key.extend_from_slice(&wrapped);

    Ok(HybridCiphertext {
        encrypted_key,
        encrypted_payload,
    })
}

/// Decrypt a [`HybridCiphertext`] with the recipient's private key.
pub fn decrypt(ciphertext: &HybridCiphertext, recipient: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.encrypted_key.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::Malformed(format!(
            "wrapped key is {} bytes, expected {WRAPPED_KEY_LEN}",
            ciphertext.encrypted_key.len()
        )));
    }
    if ciphertext.encrypted_payload.len() < NONCE_LEN {
        return Err(CryptoError::Malformed("payload shorter than nonce".into()));
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&ciphertext.encrypted_key[..32]);

    let secret = StaticSecret::from(ed25519_private_to_x25519(&recipient.0));
    let own_x = X25519Public::from(&secret);
    let shared = secret.diffie_hellman(&X25519Public::from(ephemeral_bytes));
    let kek = key_encryption_key(shared.as_bytes(), &ephemeral_bytes, own_x.as_bytes());

    let wrap_cipher = ChaCha20Poly1305::new_from_slice(&kek).map_err(|_| CryptoError::Decryption)?;
    let sym_key = wrap_cipher
        .decrypt(&Nonce::default(), &ciphertext.encrypted_key[32..])
        .map_err(|_| CryptoError::Decryption)?;

    let payload_cipher =
        ChaCha20Poly1305::new_from_slice(&sym_key).map_err(|_| CryptoError::Decryption)?;
    let (nonce, body) = ciphertext.encrypted_payload.split_at(NONCE_LEN);
    payload_cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::keypair_from_seed;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let recipient = keypair_from_seed(&[2u8; 32]);
        let ct = encrypt(b"data request payload", &recipient.public).unwrap();

        assert_eq!(ct.encrypted_key.len(), WRAPPED_KEY_LEN);
        assert_eq!(ct.encrypted_payload.len(), NONCE_LEN + 20 + 16);

        let pt = decrypt(&ct, &recipient.private).unwrap();
        assert_eq!(pt, b"data request payload");
    }

    #[test]
    fn keys_are_single_use() {
        let recipient = keypair_from_seed(&[2u8; 32]);
        let a = encrypt(b"same", &recipient.public).unwrap();
        let b = encrypt(b"same", &recipient.public).unwrap();
        assert_ne!(a.encrypted_key, b.encrypted_key);
        assert_ne!(a.encrypted_payload, b.encrypted_payload);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let recipient = keypair_from_seed(&[2u8; 32]);
        let other = keypair_from_seed(&[3u8; 32]);
        let ct = encrypt(b"secret", &recipient.public).unwrap();
        assert!(matches!(decrypt(&ct, &other.private), Err(CryptoError::Decryption)));
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let recipient = keypair_from_seed(&[2u8; 32]);
        let mut ct = encrypt(b"secret", &recipient.public).unwrap();
        let last = ct.encrypted_payload.len() - 1;
        ct.encrypted_payload[last] ^= 0xFF;
        assert!(matches!(decrypt(&ct, &recipient.private), Err(CryptoError::Decryption)));
    }

    #[test]
    fn truncated_key_is_malformed() {
        let recipient = keypair_from_seed(&[2u8; 32]);
        let mut ct = encrypt(b"secret", &recipient.public).unwrap();
        ct.encrypted_key.truncate(10);
        assert!(matches!(decrypt(&ct, &recipient.private), Err(CryptoError::Malformed(_))));
    }
}
