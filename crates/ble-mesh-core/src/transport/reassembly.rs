//! [`ReassemblyBuffer`]: reconstructs whole messages from received
//! fragments, keyed by `fragment_id`, carrying `original_type`/`recipient`
//! through to the reassembled message, and adding a stale-window eviction
//! pass so a peer that vanishes mid-transfer doesn't leak assembly state
//! forever.

use std::collections::HashMap;
use std::time::Duration;

use super::fragment::Fragment;

#[derive(Debug)]
struct Assembly {
    total: u16,
    received: Vec<Option<Vec<u8>>>,
    received_count: usize,
    original_type: u8,
    recipient: Vec<u8>,
    ttl: u8,
    last_update_ms: u64,
}

impl Assembly {
    fn new(fragment: &Fragment, now_ms: u64) -> Self {
        Self {
            total: fragment.total,
            received: vec![None; fragment.total as usize],
            received_count: 0,
            original_type: fragment.original_type,
            recipient: fragment.recipient.clone(),
            ttl: fragment.ttl,
            last_update_ms: now_ms,
        }
    }

    fn insert(&mut self, index: u16, payload: Vec<u8>, now_ms: u64) -> bool {
        self.last_update_ms = now_ms;
        let idx = index as usize;
        if idx >= self.received.len() {
            return false;
        }
        if self.received[idx].is_none() {
            self.received[idx] = Some(payload);
            self.received_count += 1;
        }
        self.received_count == self.received.len()
    }

    fn reassemble(self, fragment_id: [u8; 8]) -> ReassembledMessage {
        let mut payload = Vec::new();
        for bytes in self.received.into_iter().flatten() {
            payload.extend_from_slice(&bytes);
        }
        ReassembledMessage {
            fragment_id,
            original_type: self.original_type,
            recipient: self.recipient,
            ttl: self.ttl,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub fragment_id: [u8; 8],
    pub original_type: u8,
    pub recipient: Vec<u8>,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    assemblies: HashMap<[u8; 8], Assembly>,
    stale_after: Duration,
}

impl ReassemblyBuffer {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            stale_after,
        }
    }

    /// Feeds one fragment in. Returns the completed message once every
    /// fragment of its `fragment_id` has arrived; a mismatched `total`
    /// for an in-flight id is treated as a corrupt/replayed fragment and
    /// dropped rather than restarting the assembly.
    pub fn ingest(&mut self, fragment: Fragment, now_ms: u64) -> Option<ReassembledMessage> {
        let fragment_id = fragment.fragment_id;
        let total = fragment.total;
        let index = fragment.index;
        let payload = fragment.payload.clone();

        let entry = self
            .assemblies
            .entry(fragment_id)
            .or_insert_with(|| Assembly::new(&fragment, now_ms));
        if entry.total != total {
            return None;
        }
        let complete = entry.insert(index, payload, now_ms);
        if complete {
            let assembly = self.assemblies.remove(&fragment_id)?;
            return Some(assembly.reassemble(fragment_id));
        }
        None
    }

    /// Drops any assembly that hasn't received a fragment within
    /// `stale_after`. Returns the fragment ids evicted, for logging.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<[u8; 8]> {
        let stale_after_ms = self.stale_after.as_millis() as u64;
        let stale: Vec<[u8; 8]> = self
            .assemblies
            .iter()
            .filter(|(_, assembly)| now_ms.saturating_sub(assembly.last_update_ms) >= stale_after_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.assemblies.remove(id);
        }
        stale
    }

    pub fn pending_count(&self) -> usize {
        self.assemblies.len()
    }
}
