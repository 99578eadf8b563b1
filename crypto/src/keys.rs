//! Ed25519 node keys and their X25519 counterparts.
//!
//! A node registers a single Ed25519 public key on the ledger. The same key
//! pair is used for signing and, through the Edwards to Montgomery map, for
//! the X25519 agreement that wraps per-message symmetric keys.

use ed25519_dalek::SigningKey;
use idnet_types::{KeyPair, PrivateKey, PublicKey};
use rand::rngs::OsRng;

/// Generate a new Ed25519 key pair from a secure random source.
pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        private: PrivateKey(signing_key.to_bytes()),
    }
}

/// Derive the public key from a private key.
pub fn public_from_private(private: &PrivateKey) -> PublicKey {
    let signing_key = SigningKey::from_bytes(&private.0);
    PublicKey(signing_key.verifying_key().to_bytes())
}

/// Reconstruct a full key pair from a private key.
pub fn keypair_from_private(private: PrivateKey) -> KeyPair {
    let public = public_from_private(&private);
    KeyPair { public, private }
}

/// Derive a key pair from a 32-byte seed (deterministic).
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    keypair_from_private(PrivateKey(*seed))
}

/// Convert an Ed25519 private key (seed) to X25519 scalar bytes.
///
/// The matching X25519 public key is `ed25519_public_to_x25519(&public)`.
pub fn ed25519_private_to_x25519(ed25519_private: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(ed25519_private).to_scalar_bytes()
}

/// Convert an Ed25519 public key to its X25519 (Montgomery) equivalent.
///
/// Returns `None` if the public key bytes are not a valid curve point.
pub fn ed25519_public_to_x25519(ed25519_public: &[u8; 32]) -> Option<[u8; 32]> {
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(ed25519_public).ok()?;
    Some(verifying_key.to_montgomery().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_from_private_is_deterministic() {
        let kp = generate_keypair();
        assert_eq!(kp.public, public_from_private(&kp.private));
    }

    #[test]
    fn keypair_from_seed_deterministic() {
        let kp1 = keypair_from_seed(&[42u8; 32]);
        let kp2 = keypair_from_seed(&[42u8; 32]);
        assert_eq!(kp1.public, kp2.public);
        assert_ne!(kp1.public, keypair_from_seed(&[43u8; 32]).public);
    }

    #[test]
    fn ed25519_to_x25519_keypair_is_consistent() {
        let kp = generate_keypair();
        let x_secret = ed25519_private_to_x25519(&kp.private.0);
        let x_public = ed25519_public_to_x25519(&kp.public.0).unwrap();

        let static_secret = x25519_dalek::StaticSecret::from(x_secret);
        let derived = x25519_dalek::PublicKey::from(&static_secret);

        assert_eq!(x_public, *derived.as_bytes());
    }
}
