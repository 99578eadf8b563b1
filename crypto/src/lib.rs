//! Cryptographic primitives for idnet.
//!
//! - **Ed25519** for node identity, signing and signature verification
//! - **Blake2b-256** for message hashing
//! - **X25519 + ChaCha20-Poly1305** hybrid encryption: a fresh random
//!   symmetric key per message, wrapped to the recipient's key

pub mod encryption;
pub mod error;
pub mod hash;
pub mod keys;
pub mod sign;

pub use encryption::{decrypt, encrypt, HybridCiphertext};
pub use error::CryptoError;
pub use hash::{blake2b_256, blake2b_256_multi};
pub use keys::{
    ed25519_private_to_x25519, ed25519_public_to_x25519, generate_keypair, keypair_from_private,
    keypair_from_seed, public_from_private,
};
pub use sign::{sign_message, verify_signature};
