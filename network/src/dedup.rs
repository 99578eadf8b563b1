//! Time-windowed dedup table for inbound `(sender, msg_id)` pairs.
//!
//! An entry is created on first receipt and deleted by its own expiry
//! timer. While it exists, a redelivery of the same pair is dropped. The
//! window must outlast the sender's whole retry ceiling. Entries are
//! persisted with their expiry so the window survives a restart.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use idnet_store::{DedupRecord, DedupStore, StoreError};
use idnet_types::{Clock, MsgId, NodeId, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, warn};

type DedupKey = (NodeId, MsgId);

pub struct DedupTable {
    entries: Mutex<HashMap<DedupKey, Timestamp>>,
    store: DedupStore,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupTable {
    pub fn new(store: DedupStore, ttl: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            store,
            ttl,
            clock,
        })
    }

    /// Record first receipt of a pair. Returns `false` when a live entry
    /// already exists (a duplicate).
    pub fn try_insert(self: &Arc<Self>, sender: &NodeId, msg_id: &MsgId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let key = (sender.clone(), msg_id.clone());
        let expires_at = now.saturating_add(self.ttl);
        {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get(&key) {
                if !existing.has_passed(now) {
                    return Ok(false);
                }
            }
            self.store.put(&DedupRecord {
                sender: sender.clone(),
                msg_id: msg_id.clone(),
                expires_at,
            })?;
            entries.insert(key.clone(), expires_at);
        }
        self.arm(key, expires_at);
        Ok(true)
    }

    /// Drop an entry early, so a redelivery is accepted again.
    pub fn forget(&self, sender: &NodeId, msg_id: &MsgId) {
        let key = (sender.clone(), msg_id.clone());
        self.entries.lock().remove(&key);
        if let Err(e) = self.store.delete(sender, msg_id) {
            warn!(%sender, %msg_id, error = %e, "failed to delete dedup record");
        }
    }

    pub fn contains(&self, sender: &NodeId, msg_id: &MsgId) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(&(sender.clone(), msg_id.clone()))
            .is_some_and(|exp| !exp.has_passed(now))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload persisted entries and re-arm their timers. Already expired
    /// records are deleted. Returns `(restored, dropped)`.
    pub fn restore(self: &Arc<Self>) -> Result<(usize, usize), StoreError> {
        let now = self.clock.now();
        let mut restored = 0;
        let mut dropped = 0;
        for record in self.store.all()? {
            if record.expires_at.has_passed(now) {
                self.store.delete(&record.sender, &record.msg_id)?;
                dropped += 1;
                continue;
            }
            let key = (record.sender, record.msg_id);
            self.entries
                .lock()
                .insert(key.clone(), record.expires_at);
            self.arm(key, record.expires_at);
            restored += 1;
        }
        Ok((restored, dropped))
    }

    fn arm(self: &Arc<Self>, key: DedupKey, expires_at: Timestamp) {
        let delay = self.clock.now().elapsed_since(expires_at);
        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(table) = table.upgrade() {
                table.expire(&key, expires_at);
            }
        });
    }

    fn expire(&self, key: &DedupKey, expires_at: Timestamp) {
        let mut entries = self.entries.lock();
        // A later insert for the same pair re-armed its own timer.
        if entries.get(key) != Some(&expires_at) {
            return;
        }
        entries.remove(key);
        drop(entries);
        if let Err(e) = self.store.delete(&key.0, &key.1) {
            warn!(sender = %key.0, msg_id = %key.1, error = %e, "failed to delete expired dedup record");
        } else {
            debug!(sender = %key.0, msg_id = %key.1, "dedup entry expired");
        }
    }
}
