//! Envelope wire types.
//!
//! An [`EncryptedEnvelope`] is what travels between nodes. Decrypted, it
//! holds a [`SealedBody`]: either a signed [`Envelope`] for this node, or a
//! [`ProxyEnvelope`] carrying another `EncryptedEnvelope` for a node the
//! proxy represents.

use idnet_crypto::{
    blake2b_256, blake2b_256_multi, decrypt, encrypt, sign_message, verify_signature,
    HybridCiphertext,
};
use idnet_messages::MessageType;
use idnet_types::{NodeId, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::codec::{CompressionAlgorithm, EncodedPayload};
use crate::error::SealError;
use crate::version::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// The signed, typed unit of application payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub signature: Signature,
    pub compression: Option<CompressionAlgorithm>,
}

impl Envelope {
    /// Sign an encoded payload at the current protocol version.
    pub fn new_signed(encoded: &EncodedPayload, signer: &PrivateKey) -> Self {
        let signing_bytes = Self::signing_bytes(
            PROTOCOL_VERSION,
            encoded.message_type,
            encoded.compression,
            &encoded.bytes,
        );
        Self {
            version: PROTOCOL_VERSION,
            message_type: encoded.message_type,
            payload: encoded.bytes.clone(),
            signature: sign_message(&signing_bytes, signer),
            compression: encoded.compression,
        }
    }

    fn signing_bytes(
        version: u16,
        message_type: MessageType,
        compression: Option<CompressionAlgorithm>,
        payload: &[u8],
    ) -> [u8; 32] {
        let payload_hash = blake2b_256(payload);
        let compression_tag = [compression.map_or(0, |c| c.tag())];
        blake2b_256_multi(&[
            &version.to_le_bytes(),
            message_type.as_str().as_bytes(),
            &compression_tag,
            &payload_hash,
        ])
    }

    pub fn verify(&self, signer: &PublicKey) -> bool {
        let signing_bytes =
            Self::signing_bytes(self.version, self.message_type, self.compression, &self.payload);
        verify_signature(&signing_bytes, &self.signature, signer)
    }

    /// The payload as the codec sees it.
    pub fn encoded(&self) -> EncodedPayload {
        EncodedPayload {
            message_type: self.message_type,
            bytes: self.payload.clone(),
            compression: self.compression,
        }
    }
}

/// Re-wrapping of an already sealed envelope for delivery through a proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEnvelope {
    pub version: u16,
    /// A bincode-encoded [`EncryptedEnvelope`] sealed to `receiver`.
    pub inner_payload: Vec<u8>,
    pub signature: Signature,
    pub sender: NodeId,
    pub receiver: NodeId,
}

impl ProxyEnvelope {
    pub fn new_signed(
        inner: &EncryptedEnvelope,
        sender: NodeId,
        receiver: NodeId,
        signer: &PrivateKey,
    ) -> Result<Self, SealError> {
        let inner_payload = inner.to_bytes()?;
        let signing_bytes = Self::signing_bytes(&inner_payload, &sender, &receiver);
        Ok(Self {
            version: PROTOCOL_VERSION,
            inner_payload,
            signature: sign_message(&signing_bytes, signer),
            sender,
            receiver,
        })
    }

    /// `hash(inner) | receiver | sender`
    fn signing_bytes(inner_payload: &[u8], sender: &NodeId, receiver: &NodeId) -> [u8; 32] {
        let inner_hash = blake2b_256(inner_payload);
        blake2b_256_multi(&[
            &inner_hash,
            b"|",
            receiver.as_str().as_bytes(),
            b"|",
            sender.as_str().as_bytes(),
        ])
    }

    pub fn verify(&self, signer: &PublicKey) -> bool {
        let signing_bytes = Self::signing_bytes(&self.inner_payload, &self.sender, &self.receiver);
        verify_signature(&signing_bytes, &self.signature, signer)
    }

    pub fn inner(&self) -> Result<EncryptedEnvelope, SealError> {
        EncryptedEnvelope::from_bytes(&self.inner_payload)
    }
}

/// Plaintext of an [`EncryptedEnvelope`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealedBody {
    Direct(Envelope),
    Proxied(ProxyEnvelope),
}

impl SealedBody {
    /// Encrypt under a fresh single-use key wrapped to `recipient`.
    pub fn encrypt_to(&self, recipient: &PublicKey) -> Result<EncryptedEnvelope, SealError> {
        let plaintext =
            bincode::serialize(self).map_err(|e| SealError::Malformed(e.to_string()))?;
        let HybridCiphertext {
            encrypted_key,
            encrypted_payload,
        } = encrypt(&plaintext, recipient)?;
        Ok(EncryptedEnvelope {
            encrypted_symmetric_key: encrypted_key,
            encrypted_payload,
        })
    }
}

/// On-the-wire form of either envelope kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted_symmetric_key: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn decrypt_body(&self, recipient: &PrivateKey) -> Result<SealedBody, SealError> {
        let ciphertext = HybridCiphertext {
            encrypted_key: self.encrypted_symmetric_key.clone(),
            encrypted_payload: self.encrypted_payload.clone(),
        };
        let plaintext = decrypt(&ciphertext, recipient)?;
        deserialize_bounded(&plaintext)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SealError> {
        bincode::serialize(self).map_err(|e| SealError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        deserialize_bounded(bytes)
    }
}

fn deserialize_bounded<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SealError> {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_PAYLOAD_SIZE as u64 * 2)
        .deserialize(bytes)
        .map_err(|e| SealError::Malformed(e.to_string()))
}
