//! Secure Envelope Layer: sign, encrypt and (for proxied receivers)
//! double-wrap envelopes; open them again layer by layer.
//!
//! Proxy routing applies two full sign/encrypt layers. The envelope is
//! sealed to the end receiver first, then re-wrapped in a [`ProxyEnvelope`]
//! and sealed to the proxy. Opening removes the layers in reverse order,
//! and every signature found is checked against the signer's on-ledger key.

use std::collections::HashMap;
use std::sync::Arc;

use idnet_types::{KeyPair, NodeId, PrivateKey};

use crate::codec::EncodedPayload;
use crate::directory::{NodeDirectory, Route};
use crate::envelope::{EncryptedEnvelope, Envelope, ProxyEnvelope, SealedBody};
use crate::error::{Layer, SealError};
use crate::version::PROTOCOL_VERSION;

/// Seal an encoded payload from `sender` along `route`.
pub fn seal(
    encoded: &EncodedPayload,
    route: &Route,
    sender: &NodeId,
    sender_keys: &KeyPair,
) -> Result<EncryptedEnvelope, SealError> {
    let envelope = Envelope::new_signed(encoded, &sender_keys.private);
    match route {
        Route::Direct { receiver_key, .. } => SealedBody::Direct(envelope).encrypt_to(receiver_key),
        Route::ViaProxy {
            receiver,
            receiver_key,
            proxy_key,
            ..
        } => {
            let inner = SealedBody::Direct(envelope).encrypt_to(receiver_key)?;
            let proxied = ProxyEnvelope::new_signed(
                &inner,
                sender.clone(),
                receiver.clone(),
                &sender_keys.private,
            )?;
            SealedBody::Proxied(proxied).encrypt_to(proxy_key)
        }
    }
}

/// Result of removing one layer.
#[derive(Debug)]
pub enum Opened {
    /// A verified envelope addressed to the key holder.
    Envelope(Envelope),
    /// A verified proxy layer; `inner` is still sealed to `receiver`.
    Proxied {
        sender: NodeId,
        receiver: NodeId,
        inner: EncryptedEnvelope,
    },
}

fn check_version(found: u16) -> Result<(), SealError> {
    if found != PROTOCOL_VERSION {
        return Err(SealError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found,
        });
    }
    Ok(())
}

fn signer_key(
    directory: &dyn NodeDirectory,
    signer: &NodeId,
) -> Result<idnet_types::PublicKey, SealError> {
    directory
        .public_key(signer)
        .map_err(|_| SealError::UnknownSigner(signer.clone()))
}

/// Remove one layer with `own_key`, verifying it against `claimed_sender`.
pub fn open(
    sealed: &EncryptedEnvelope,
    own_key: &PrivateKey,
    claimed_sender: &NodeId,
    directory: &dyn NodeDirectory,
) -> Result<Opened, SealError> {
    match sealed.decrypt_body(own_key)? {
        SealedBody::Direct(envelope) => {
            check_version(envelope.version)?;
            let key = signer_key(directory, claimed_sender)?;
            if !envelope.verify(&key) {
                return Err(SealError::SignatureMismatch {
                    layer: Layer::Envelope,
                });
            }
            Ok(Opened::Envelope(envelope))
        }
        SealedBody::Proxied(proxy) => {
            check_version(proxy.version)?;
            if proxy.sender != *claimed_sender {
                return Err(SealError::SenderMismatch {
                    transport: claimed_sender.clone(),
                    envelope: proxy.sender,
                });
            }
            let key = signer_key(directory, &proxy.sender)?;
            if !proxy.verify(&key) {
                return Err(SealError::SignatureMismatch {
                    layer: Layer::Proxy,
                });
            }
            let inner = proxy.inner()?;
            Ok(Opened::Proxied {
                sender: proxy.sender,
                receiver: proxy.receiver,
                inner,
            })
        }
    }
}

/// Key pairs this node can open envelopes with: its own, plus those of
/// the nodes it fronts as a proxy.
#[derive(Clone)]
pub struct Keyring {
    own_id: NodeId,
    keys: HashMap<NodeId, Arc<KeyPair>>,
}

impl Keyring {
    pub fn new(own_id: NodeId, own_keys: Arc<KeyPair>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(own_id.clone(), own_keys);
        Self { own_id, keys }
    }

    pub fn with_represented(mut self, node: NodeId, keys: Arc<KeyPair>) -> Self {
        self.keys.insert(node, keys);
        self
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn own_keys(&self) -> &Arc<KeyPair> {
        &self.keys[&self.own_id]
    }

    pub fn get(&self, node: &NodeId) -> Option<&Arc<KeyPair>> {
        self.keys.get(node)
    }
}

/// A fully opened, verified envelope.
#[derive(Debug)]
pub struct OpenedEnvelope {
    pub envelope: Envelope,
    /// Original signer of the envelope.
    pub sender: NodeId,
    /// The node it was addressed to (this node or one it represents).
    pub receiver: NodeId,
    pub via_proxy: bool,
}

/// Remove every layer of a message received from `transport_sender`.
pub fn open_layers(
    sealed: &EncryptedEnvelope,
    keyring: &Keyring,
    transport_sender: &NodeId,
    directory: &dyn NodeDirectory,
) -> Result<OpenedEnvelope, SealError> {
    let own_key = &keyring.own_keys().private;
    match open(sealed, own_key, transport_sender, directory)? {
        Opened::Envelope(envelope) => Ok(OpenedEnvelope {
            envelope,
            sender: transport_sender.clone(),
            receiver: keyring.own_id().clone(),
            via_proxy: false,
        }),
        Opened::Proxied {
            sender,
            receiver,
            inner,
        } => {
            let receiver_keys = keyring
                .get(&receiver)
                .ok_or_else(|| SealError::NotAddressedToUs(receiver.clone()))?;
            match open(&inner, &receiver_keys.private, &sender, directory)? {
                Opened::Envelope(envelope) => Ok(OpenedEnvelope {
                    envelope,
                    sender,
                    receiver,
                    via_proxy: true,
                }),
                Opened::Proxied { .. } => {
                    Err(SealError::Malformed("nested proxy envelope".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use idnet_crypto::keypair_from_seed;
    use idnet_messages::MessageType;
    use idnet_types::{PublicKey, Signature};

    struct TestDirectory {
        keys: HashMap<NodeId, PublicKey>,
        proxies: HashMap<NodeId, NodeId>,
    }

    impl NodeDirectory for TestDirectory {
        fn public_key(&self, node: &NodeId) -> Result<PublicKey, DirectoryError> {
            self.keys
                .get(node)
                .cloned()
                .ok_or_else(|| DirectoryError::UnknownKey(node.clone()))
        }

        fn address(&self, node: &NodeId) -> Result<String, DirectoryError> {
            Ok(format!("{node}.test:9000"))
        }

        fn proxy_for(&self, node: &NodeId) -> Option<NodeId> {
            self.proxies.get(node).cloned()
        }
    }

    struct Fixture {
        sender: Arc<KeyPair>,
        proxy: Arc<KeyPair>,
        receiver: Arc<KeyPair>,
        directory: TestDirectory,
    }

    fn fixture() -> Fixture {
        let sender = Arc::new(keypair_from_seed(&[1u8; 32]));
        let proxy = Arc::new(keypair_from_seed(&[2u8; 32]));
        let receiver = Arc::new(keypair_from_seed(&[3u8; 32]));
        let mut keys = HashMap::new();
        keys.insert(NodeId::new("rp"), sender.public.clone());
        keys.insert(NodeId::new("proxy"), proxy.public.clone());
        keys.insert(NodeId::new("idp"), receiver.public.clone());
        let mut proxies = HashMap::new();
        proxies.insert(NodeId::new("idp"), NodeId::new("proxy"));
        Fixture {
            sender,
            proxy,
            receiver,
            directory: TestDirectory { keys, proxies },
        }
    }

    fn payload() -> EncodedPayload {
        EncodedPayload {
            message_type: MessageType::ConsentRequest,
            bytes: b"{\"hello\":1}".to_vec(),
            compression: None,
        }
    }

    fn proxy_keyring(f: &Fixture) -> Keyring {
        Keyring::new("proxy".into(), f.proxy.clone())
            .with_represented("idp".into(), f.receiver.clone())
    }

    #[test]
    fn direct_roundtrip() {
        let f = fixture();
        let route = Route::Direct {
            receiver: "rp".into(),
            receiver_key: f.sender.public.clone(),
        };
        // self-addressed to keep the fixture small
        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();
        let keyring = Keyring::new("rp".into(), f.sender.clone());
        let opened = open_layers(&sealed, &keyring, &"rp".into(), &f.directory).unwrap();
        assert_eq!(opened.envelope.payload, payload().bytes);
        assert!(!opened.via_proxy);
    }

    #[test]
    fn proxy_roundtrip_opens_in_lifo_order() {
        let f = fixture();
        let (route, address) = f.directory.route(&"idp".into()).unwrap();
        assert_eq!(route.next_hop(), &NodeId::new("proxy"));
        assert_eq!(address, "proxy.test:9000");

        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();

        // Outer layer opens only with the proxy's key.
        assert!(matches!(
            open(&sealed, &f.receiver.private, &"rp".into(), &f.directory),
            Err(SealError::Decryption(_))
        ));
        let Opened::Proxied { sender, receiver, inner } =
            open(&sealed, &f.proxy.private, &"rp".into(), &f.directory).unwrap()
        else {
            panic!("expected proxy layer");
        };
        assert_eq!(sender, NodeId::new("rp"));
        assert_eq!(receiver, NodeId::new("idp"));

        let Opened::Envelope(env) = open(&inner, &f.receiver.private, &sender, &f.directory).unwrap()
        else {
            panic!("expected envelope");
        };
        assert_eq!(env.payload, payload().bytes);

        let opened = open_layers(&sealed, &proxy_keyring(&f), &"rp".into(), &f.directory).unwrap();
        assert!(opened.via_proxy);
        assert_eq!(opened.receiver, NodeId::new("idp"));
        assert_eq!(opened.envelope, env);
    }

    #[test]
    fn tampered_proxy_signature_is_signature_mismatch() {
        let f = fixture();
        let inner = SealedBody::Direct(Envelope::new_signed(&payload(), &f.sender.private))
            .encrypt_to(&f.receiver.public)
            .unwrap();
        let mut proxied =
            ProxyEnvelope::new_signed(&inner, "rp".into(), "idp".into(), &f.sender.private).unwrap();
        proxied.signature = Signature([9u8; 64]);
        let sealed = SealedBody::Proxied(proxied).encrypt_to(&f.proxy.public).unwrap();

        let err = open_layers(&sealed, &proxy_keyring(&f), &"rp".into(), &f.directory).unwrap_err();
        assert!(matches!(
            err,
            SealError::SignatureMismatch {
                layer: Layer::Proxy
            }
        ));
    }

    #[test]
    fn tampered_inner_signature_is_signature_mismatch() {
        let f = fixture();
        let mut envelope = Envelope::new_signed(&payload(), &f.sender.private);
        envelope.signature = Signature([7u8; 64]);
        let inner = SealedBody::Direct(envelope).encrypt_to(&f.receiver.public).unwrap();
        let proxied =
            ProxyEnvelope::new_signed(&inner, "rp".into(), "idp".into(), &f.sender.private).unwrap();
        let sealed = SealedBody::Proxied(proxied).encrypt_to(&f.proxy.public).unwrap();

        let err = open_layers(&sealed, &proxy_keyring(&f), &"rp".into(), &f.directory).unwrap_err();
        assert!(matches!(
            err,
            SealError::SignatureMismatch {
                layer: Layer::Envelope
            }
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let f = fixture();
        let mut envelope = Envelope::new_signed(&payload(), &f.sender.private);
        envelope.version = PROTOCOL_VERSION + 1;
        let sealed = SealedBody::Direct(envelope).encrypt_to(&f.receiver.public).unwrap();
        let err = open(&sealed, &f.receiver.private, &"rp".into(), &f.directory).unwrap_err();
        assert!(matches!(
            err,
            SealError::VersionMismatch { expected, found } if expected == PROTOCOL_VERSION && found == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let f = fixture();
        let route = Route::Direct {
            receiver: "idp".into(),
            receiver_key: f.receiver.public.clone(),
        };
        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();
        let err = open(&sealed, &f.receiver.private, &"stranger".into(), &f.directory).unwrap_err();
        assert!(matches!(err, SealError::UnknownSigner(id) if id.as_str() == "stranger"));
    }

    #[test]
    fn impersonated_sender_fails_signature() {
        let f = fixture();
        let route = Route::Direct {
            receiver: "idp".into(),
            receiver_key: f.receiver.public.clone(),
        };
        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();
        let err = open(&sealed, &f.receiver.private, &"proxy".into(), &f.directory).unwrap_err();
        assert!(matches!(
            err,
            SealError::SignatureMismatch {
                layer: Layer::Envelope
            }
        ));
    }

    #[test]
    fn proxy_layer_sender_must_match_transport() {
        let f = fixture();
        let (route, _) = f.directory.route(&"idp".into()).unwrap();
        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();
        let err = open(&sealed, &f.proxy.private, &"idp".into(), &f.directory).unwrap_err();
        assert!(matches!(err, SealError::SenderMismatch { .. }));
    }

    #[test]
    fn proxied_for_unrepresented_node_is_rejected() {
        let f = fixture();
        let (route, _) = f.directory.route(&"idp".into()).unwrap();
        let sealed = seal(&payload(), &route, &"rp".into(), &f.sender).unwrap();
        let keyring = Keyring::new("proxy".into(), f.proxy.clone());
        let err = open_layers(&sealed, &keyring, &"rp".into(), &f.directory).unwrap_err();
        assert!(matches!(err, SealError::NotAddressedToUs(id) if id.as_str() == "idp"));
    }
}
