//! Nullable transport: record frames instead of sending them.

use async_trait::async_trait;
use idnet_network::{FrameHandler, Transport, TransportError, WireFrame};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One attempted delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentFrame {
    pub address: String,
    pub frame: WireFrame,
    pub delivered: bool,
}

/// A test transport.
///
/// Every attempt is recorded. An attempt succeeds unless the address is
/// marked unreachable or a forced failure is pending. Addresses can be
/// routed to a [`FrameHandler`] (another node's inbound pipeline), in
/// which case the handler's answer decides the outcome.
#[derive(Default)]
pub struct NullTransport {
    attempts: Mutex<Vec<SentFrame>>,
    unreachable: Mutex<HashSet<String>>,
    fail_next: AtomicUsize,
    routes: Mutex<HashMap<String, Arc<dyn FrameHandler>>>,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    /// Fail the next `n` attempts regardless of address.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Hand frames sent to `address` to `handler`.
    pub fn route_to(&self, address: &str, handler: Arc<dyn FrameHandler>) {
        self.routes
            .lock()
            .insert(address.to_string(), handler);
    }

    /// Every attempt so far, in order.
    pub fn attempts(&self) -> Vec<SentFrame> {
        self.attempts.lock().clone()
    }

    /// Frames that were acknowledged.
    pub fn delivered(&self) -> Vec<SentFrame> {
        self.attempts()
            .into_iter()
            .filter(|s| s.delivered)
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn reset(&self) {
        self.attempts.lock().clear();
    }

    fn record(&self, address: &str, frame: WireFrame, delivered: bool) {
        self.attempts.lock().push(SentFrame {
            address: address.to_string(),
            frame,
            delivered,
        });
    }

    fn take_forced_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, address: &str, frame: WireFrame) -> Result<(), TransportError> {
        if self.take_forced_failure() || self.unreachable.lock().contains(address) {
            self.record(address, frame, false);
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "unreachable".into(),
            });
        }
        let handler = self.routes.lock().get(address).cloned();
        match handler {
            Some(handler) => match handler.on_frame(frame.clone()).await {
                Ok(()) => {
                    self.record(address, frame, true);
                    Ok(())
                }
                Err(e) => {
                    self.record(address, frame, false);
                    Err(TransportError::Refused(e.to_string()))
                }
            },
            None => {
                self.record(address, frame, true);
                Ok(())
            }
        }
    }
}
