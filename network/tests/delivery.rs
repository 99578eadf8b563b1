//! Outbound delivery and inbound receipt between nodes wired through the
//! nullable transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use idnet_crypto::keypair_from_seed;
use idnet_messages::{ConsentRequest, ProtocolMessage, SchemaRegistry};
use idnet_network::*;
use idnet_nullables::{NullBackend, NullDirectory, NullTransport};
use idnet_protocol::codec::{self, CodecConfig};
use idnet_protocol::{seal, Keyring, NodeDirectory};
use idnet_store::{
    DedupStore, InboundRawStore, MessageLog, PendingOutboundMessage, PendingSendStore, RawInbound,
};
use idnet_types::{Clock, KeyPair, MsgId, NodeId, RequestId, Timestamp};
use prometheus::Registry;

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<ReceivedMessage>>,
    fail: AtomicBool,
}

impl RecordingSink {
    fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn deliver(&self, message: ReceivedMessage) -> Result<(), HandoffError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HandoffError("gate unavailable".into()));
        }
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

struct TestNode {
    id: NodeId,
    keys: Arc<KeyPair>,
    backend: Arc<NullBackend>,
    outbound: Arc<OutboundManager>,
    inbound: Arc<InboundPipeline>,
    sink: Arc<RecordingSink>,
    metrics: Arc<NetworkMetrics>,
    clock: Arc<TokioClock>,
}

struct Network {
    directory: Arc<NullDirectory>,
    transport: Arc<NullTransport>,
}

const DEDUP_TTL: Duration = Duration::from_secs(30 * 60);

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(4),
        multiplier: 2.0,
        max_elapsed: Duration::from_secs(30),
        randomization_factor: 0.0,
    }
}

impl Network {
    fn new() -> Self {
        Self {
            directory: Arc::new(NullDirectory::new()),
            transport: Arc::new(NullTransport::new()),
        }
    }

    fn node(&self, name: &str, seed: u8) -> TestNode {
        let keys = Arc::new(keypair_from_seed(&[seed; 32]));
        self.node_with_keyring(name, Keyring::new(NodeId::new(name), keys))
    }

    fn node_with_keyring(&self, name: &str, keyring: Keyring) -> TestNode {
        let id = NodeId::new(name);
        let keys = Arc::clone(keyring.own_keys());
        let address = format!("{name}.test:7700");
        self.directory
            .register(&id, keys.public.clone(), address.clone());

        let backend = Arc::new(NullBackend::new());
        let clock = Arc::new(TokioClock::new());
        let metrics = Arc::new(NetworkMetrics::new(&Registry::new()));
        let sink = Arc::new(RecordingSink::default());
        let log = Arc::new(MessageLog::new(backend.clone(), &id));

        let outbound = OutboundManager::new(
            keyring.clone(),
            self.directory.clone(),
            self.transport.clone(),
            PendingSendStore::new(backend.clone(), &id),
            log.clone(),
            clock.clone(),
            metrics.clone(),
            OutboundConfig {
                retry: fast_retry(),
                codec: CodecConfig::default(),
            },
        );
        let dedup = DedupTable::new(
            DedupStore::new(backend.clone(), &id),
            DEDUP_TTL,
            clock.clone(),
        );
        let inbound = InboundPipeline::new(
            keyring,
            self.directory.clone(),
            SchemaRegistry::all(),
            dedup,
            InboundRawStore::new(backend.clone(), &id),
            log,
            sink.clone(),
            clock.clone(),
            metrics.clone(),
        );
        self.transport.route_to(&address, inbound.clone());

        TestNode {
            id,
            keys,
            backend,
            outbound,
            inbound,
            sink,
            metrics,
            clock,
        }
    }
}

fn consent_request(request: &str, requester: &NodeId) -> ProtocolMessage {
    ConsentRequest {
        request_id: RequestId::new(request),
        requester: requester.clone(),
        namespace: "citizen_id".into(),
        identifier: "1234567890123".into(),
        request_message: "Please confirm your identity".into(),
        min_ial: 2.1,
        min_aal: 2.2,
        request_timeout_secs: 3600,
        expected_height: Some(10),
    }
    .into()
}

/// A sealed frame from `from` to `to`, built without the send manager.
fn sealed_frame(net: &Network, from: &TestNode, to: &NodeId, msg: &str) -> WireFrame {
    let encoded = codec::encode(&consent_request("r1", &from.id), &CodecConfig::default()).unwrap();
    let (route, _) = net.directory.route(to).unwrap();
    let sealed = seal(&encoded, &route, &from.id, &from.keys).unwrap();
    WireFrame {
        sender: from.id.clone(),
        msg_id: MsgId::new(msg),
        payload: sealed.to_bytes().unwrap(),
    }
}

/// Let spawned delivery and processing tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn message_reaches_receiver_sink() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let on_success: OnDelivered = {
        let delivered = delivered.clone();
        Arc::new(move |d: Delivery| delivered.lock().unwrap().push(d))
    };
    let message = consent_request("r1", &rp.id);
    let ids = rp
        .outbound
        .send(&[idp.id.clone()], &message, &rp.id, Some(on_success))
        .unwrap();
    rp.outbound.wait_idle().await;
    settle().await;

    let received = idp.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message, message);
    assert_eq!(received[0].sender, rp.id);
    assert_eq!(received[0].receiver, idp.id);
    assert_eq!(received[0].msg_id, ids[0]);
    assert!(!received[0].via_proxy);

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].attempts, 1);
    assert_eq!(rp.metrics.outbound_delivered.get(), 1);
    assert!(PendingSendStore::new(rp.backend.clone(), &rp.id).all().unwrap().is_empty());
    assert!(InboundRawStore::new(idp.backend.clone(), &idp.id).all().unwrap().is_empty());

    // Both sides logged the exchange.
    let request = RequestId::new("r1");
    assert_eq!(MessageLog::new(rp.backend.clone(), &rp.id).history(&request).unwrap().len(), 1);
    assert_eq!(MessageLog::new(idp.backend.clone(), &idp.id).history(&request).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fan_out_gives_each_receiver_its_own_message_id() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let a = net.node("idp-1", 2);
    let b = net.node("idp-2", 3);

    let ids = rp
        .outbound
        .send(&[a.id.clone(), b.id.clone()], &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap();
    rp.outbound.wait_idle().await;
    settle().await;

    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert_eq!(a.sink.received().len(), 1);
    assert_eq!(b.sink.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_receiver_sends_nothing() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);

    let err = rp
        .outbound
        .send(
            &[idp.id.clone(), NodeId::new("ghost")],
            &consent_request("r1", &rp.id),
            &rp.id,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, SendError::Directory(_)));
    assert_eq!(net.transport.attempt_count(), 0);
    assert!(PendingSendStore::new(rp.backend.clone(), &rp.id).all().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fan_out_is_persisted_whole_or_not_at_all() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let receivers: Vec<NodeId> = (2..5)
        .map(|seed| net.node(&format!("idp-{seed}"), seed).id)
        .collect();
    let pending = PendingSendStore::new(rp.backend.clone(), &rp.id);
    let log = MessageLog::new(rp.backend.clone(), &rp.id);

    // Room for a single write: the whole fan-out fits in it.
    rp.backend.fail_writes_after(1);
    let ids = rp
        .outbound
        .send(&receivers, &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(pending.all().unwrap().len(), 3);
    assert_eq!(log.history(&RequestId::new("r1")).unwrap().len(), 3);
    rp.outbound.wait_idle().await;
    let attempts = net.transport.attempt_count();

    // No room left: nothing is recorded and nothing goes out.
    let err = rp
        .outbound
        .send(&receivers, &consent_request("r2", &rp.id), &rp.id, None)
        .unwrap_err();
    assert!(matches!(err, SendError::Store(_)));
    assert!(log.history(&RequestId::new("r2")).unwrap().is_empty());
    settle().await;
    assert_eq!(net.transport.attempt_count(), attempts);
    assert_eq!(rp.outbound.in_flight(), 0);
    rp.backend.fail_writes(false);
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_are_retried_until_acknowledged() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);

    net.transport.fail_next(3);
    rp.outbound
        .send(&[idp.id.clone()], &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap();
    rp.outbound.wait_idle().await;
    settle().await;

    assert_eq!(net.transport.attempt_count(), 4);
    assert_eq!(net.transport.delivered().len(), 1);
    assert_eq!(rp.metrics.outbound_retries.get(), 3);
    assert_eq!(idp.sink.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_receiver_is_abandoned_at_the_ceiling() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    net.transport.set_unreachable("idp-1.test:7700", true);

    let started = tokio::time::Instant::now();
    rp.outbound
        .send(&[idp.id.clone()], &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap();
    rp.outbound.wait_idle().await;

    assert!(started.elapsed() <= fast_retry().max_elapsed);
    assert!(net.transport.attempt_count() > 1);
    assert_eq!(rp.metrics.outbound_abandoned.get(), 1);
    assert_eq!(rp.metrics.outbound_delivered.get(), 0);
    assert_eq!(rp.metrics.outbound_pending.get(), 0);
    assert!(PendingSendStore::new(rp.backend.clone(), &rp.id).all().unwrap().is_empty());
    assert!(idp.sink.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pending_sends_resume_after_restart() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let store = PendingSendStore::new(rp.backend.clone(), &rp.id);

    let fresh = sealed_frame(&net, &rp, &idp.id, "fresh");
    let now = rp.clock.now();
    store
        .put(&PendingOutboundMessage {
            msg_id: fresh.msg_id.clone(),
            sender: rp.id.clone(),
            receiver: idp.id.clone(),
            destination_address: "idp-1.test:7700".into(),
            payload: fresh.payload,
            send_start_time: now,
        })
        .unwrap();
    store
        .put(&PendingOutboundMessage {
            msg_id: MsgId::new("stale"),
            sender: rp.id.clone(),
            receiver: idp.id.clone(),
            destination_address: "idp-1.test:7700".into(),
            payload: vec![],
            send_start_time: Timestamp::from_millis(now.as_millis() - 3_600_000),
        })
        .unwrap();

    assert_eq!(rp.outbound.resume_pending().unwrap(), 1);
    rp.outbound.wait_idle().await;
    settle().await;

    assert_eq!(rp.metrics.outbound_abandoned.get(), 1);
    assert_eq!(idp.sink.received().len(), 1);
    assert_eq!(idp.sink.received()[0].msg_id, MsgId::new("fresh"));
    assert!(store.all().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_after_shutdown_is_refused() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    rp.outbound.shutdown();
    let err = rp
        .outbound
        .send(&[idp.id.clone()], &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap_err();
    assert!(matches!(err, SendError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_retrying_send_persisted() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    net.transport.set_unreachable("idp-1.test:7700", true);

    rp.outbound
        .send(&[idp.id.clone()], &consent_request("r1", &rp.id), &rp.id, None)
        .unwrap();
    settle().await;
    rp.outbound.shutdown();
    rp.outbound.wait_idle().await;

    assert_eq!(rp.metrics.outbound_abandoned.get(), 0);
    assert_eq!(PendingSendStore::new(rp.backend.clone(), &rp.id).all().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivery_is_handed_off_once() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let frame = sealed_frame(&net, &rp, &idp.id, "m1");

    idp.inbound.receive(frame.clone()).unwrap();
    idp.inbound.receive(frame.clone()).unwrap();
    settle().await;

    assert_eq!(idp.sink.received().len(), 1);
    assert_eq!(idp.metrics.inbound_duplicates.get(), 1);
    assert_eq!(idp.metrics.inbound_received.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn same_message_id_from_different_senders_is_not_a_duplicate() {
    let net = Network::new();
    let rp1 = net.node("rp-1", 1);
    let rp2 = net.node("rp-2", 3);
    let idp = net.node("idp-1", 2);

    idp.inbound.receive(sealed_frame(&net, &rp1, &idp.id, "m1")).unwrap();
    idp.inbound.receive(sealed_frame(&net, &rp2, &idp.id, "m1")).unwrap();
    settle().await;

    assert_eq!(idp.sink.received().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dedup_entry_expires_after_its_window() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let frame = sealed_frame(&net, &rp, &idp.id, "m1");

    idp.inbound.receive(frame.clone()).unwrap();
    settle().await;
    tokio::time::sleep(DEDUP_TTL + Duration::from_secs(1)).await;

    assert!(DedupStore::new(idp.backend.clone(), &idp.id).all().unwrap().is_empty());
    idp.inbound.receive(frame).unwrap();
    settle().await;
    assert_eq!(idp.sink.received().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn tampered_message_is_acknowledged_then_discarded() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let mut frame = sealed_frame(&net, &rp, &idp.id, "m1");
    let last = frame.payload.len() - 1;
    frame.payload[last] ^= 0x01;

    idp.inbound.receive(frame).unwrap();
    settle().await;

    assert!(idp.sink.received().is_empty());
    assert_eq!(idp.metrics.inbound_rejected.get(), 1);
    assert!(InboundRawStore::new(idp.backend.clone(), &idp.id).all().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn frame_claiming_another_sender_is_rejected() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let mallory = net.node("rp-2", 3);
    let idp = net.node("idp-1", 2);
    let mut frame = sealed_frame(&net, &mallory, &idp.id, "m1");
    frame.sender = rp.id.clone();

    idp.inbound.receive(frame).unwrap();
    settle().await;

    assert!(idp.sink.received().is_empty());
    assert_eq!(idp.metrics.inbound_rejected.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_persist_is_not_acknowledged_and_not_remembered() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let frame = sealed_frame(&net, &rp, &idp.id, "m1");

    idp.backend.fail_writes(true);
    assert!(idp.inbound.receive(frame.clone()).is_err());
    idp.backend.fail_writes(false);

    idp.inbound.receive(frame).unwrap();
    settle().await;
    assert_eq!(idp.sink.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_handoff_is_replayed_by_recovery() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);

    idp.sink.fail.store(true, Ordering::SeqCst);
    idp.inbound.receive(sealed_frame(&net, &rp, &idp.id, "m1")).unwrap();
    settle().await;
    assert_eq!(InboundRawStore::new(idp.backend.clone(), &idp.id).all().unwrap().len(), 1);

    idp.sink.fail.store(false, Ordering::SeqCst);
    let stats = idp.inbound.recover().unwrap();
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.dedup_restored, 1);
    assert_eq!(idp.sink.received().len(), 1);
    assert!(InboundRawStore::new(idp.backend.clone(), &idp.id).all().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn recovery_replays_raw_messages_in_receipt_order() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);
    let idp = net.node("idp-1", 2);
    let raw = InboundRawStore::new(idp.backend.clone(), &idp.id);

    for (msg, at) in [("late", 20), ("early", 10)] {
        let frame = sealed_frame(&net, &rp, &idp.id, msg);
        raw.put(&RawInbound {
            sender: frame.sender,
            msg_id: frame.msg_id,
            bytes: frame.payload,
            received_at: Timestamp::from_millis(at),
        })
        .unwrap();
    }

    assert_eq!(idp.inbound.recover().unwrap().replayed, 2);
    let order: Vec<_> = idp
        .sink
        .received()
        .into_iter()
        .map(|m| m.msg_id.to_string())
        .collect();
    assert_eq!(order, ["early", "late"]);
}

#[tokio::test(start_paused = true)]
async fn message_reaches_node_behind_proxy() {
    let net = Network::new();
    let rp = net.node("rp-1", 1);

    let behind_keys = Arc::new(keypair_from_seed(&[4; 32]));
    let behind = NodeId::new("idp-behind");
    net.directory
        .register(&behind, behind_keys.public.clone(), "unroutable.test:1");
    let proxy_keys = Arc::new(keypair_from_seed(&[5; 32]));
    let keyring = Keyring::new(NodeId::new("proxy-1"), proxy_keys)
        .with_represented(behind.clone(), behind_keys);
    let proxy = net.node_with_keyring("proxy-1", keyring);
    net.directory.set_proxy(&behind, &proxy.id);

    let message = consent_request("r1", &rp.id);
    rp.outbound
        .send(&[behind.clone()], &message, &rp.id, None)
        .unwrap();
    rp.outbound.wait_idle().await;
    settle().await;

    let attempts = net.transport.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].address, "proxy-1.test:7700");

    let received = proxy.sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender, rp.id);
    assert_eq!(received[0].receiver, behind);
    assert!(received[0].via_proxy);
    assert_eq!(received[0].message, message);
}
