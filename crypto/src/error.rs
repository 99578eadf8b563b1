use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: authentication check failed")]
    Decryption,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}
