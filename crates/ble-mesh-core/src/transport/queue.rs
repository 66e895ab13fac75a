//! [`TransportQueue`]: the FIFO outbound fragment queue and the
//! reassembly/forwarding pipeline for inbound traffic.
//!
//! Under the single-writer cooperative scheduling model, at most one
//! fragment is ever in flight to the driver at a time per queue;
//! `processing` guards against a second pump racing the first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::driver::{BleDriver, WriteType};
use crate::error::TransportError;
use crate::ledger::{LinkLedger, LinkRole};
use crate::peer::{PeerAddress, PeerHint};

use super::fragment::{split_into_fragments, Fragment, FragmentDecodeError};
use super::loop_guard::LoopGuard;
use super::reassembly::{ReassemblyBuffer, ReassembledMessage};

/// External collaborator that turns plaintext into ciphertext for a given
/// peer. The cipher/session state itself lives outside the core, reached
/// only through this seam.
pub trait CryptoCipher: Send + Sync {
    fn encrypt(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Whether an originating send is part of the handshake that establishes
/// a [`CryptoCipher`] session, or ordinary post-handshake data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Handshake,
    Data,
}

#[derive(Debug, Clone)]
struct QueuedFragment {
    target: PeerAddress,
    role: LinkRole,
    characteristic: String,
    bytes: Vec<u8>,
}

/// Outcome of forwarding one inbound fragment toward its next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardResult {
    /// The fragment fit within the next hop's MTU as-is; forwarded raw
    /// with its ttl decremented in place, no reassembly needed.
    RawForwarded,
    /// The fragment's ttl had already reached zero; dropped, nothing
    /// queued.
    TtlExpired,
    /// The fragment exceeds the next hop's MTU and reassembly is still
    /// in progress; nothing to forward yet.
    Buffered,
    /// The fragment exceeded the next hop's MTU, reassembly just
    /// completed, and the whole message was re-fragmented and queued at
    /// the next hop's own MTU.
    Reassembled,
}

/// FIFO outbound queue plus inbound reassembly/loop-avoidance state for
/// one local node.
pub struct TransportQueue<D, C> {
    driver: Arc<D>,
    clock: Arc<C>,
    config: Arc<CoreConfig>,
    queue: VecDeque<QueuedFragment>,
    processing: AtomicBool,
    reassembly: ReassemblyBuffer,
    loop_guard: LoopGuard,
}

impl<D: BleDriver, C: Clock> TransportQueue<D, C> {
    pub fn new(driver: Arc<D>, clock: Arc<C>, config: Arc<CoreConfig>) -> Self {
        let reassembly = ReassemblyBuffer::new(config.health_check_max_interval);
        let loop_guard = LoopGuard::new(config.no_hint_inbound_debounce_window * 10);
        Self {
            driver,
            clock,
            config,
            queue: VecDeque::new(),
            processing: AtomicBool::new(false),
            reassembly,
            loop_guard,
        }
    }

    pub fn pending_fragment_count(&self) -> usize {
        self.queue.len()
    }

    /// Fragments and enqueues a message we are originating (not
    /// forwarding). Picks the client link over the server link when a
    /// peer holds both, since a link we dialed ourselves has a known
    /// negotiated MTU and message characteristic; handshake messages
    /// bypass the cipher requirement and jump to the front of the queue
    /// so they are never stuck behind a large in-flight data transfer.
    pub fn send_originating(
        &mut self,
        ledger: &LinkLedger,
        recipient: &PeerAddress,
        original_type: u8,
        payload: &[u8],
        kind: MessageKind,
        cipher: Option<&dyn CryptoCipher>,
        fragment_id: [u8; 8],
    ) -> Result<(), TransportError> {
        let (role, mtu, characteristic) = self.resolve_egress(ledger, recipient)?;

        let wire_payload = match kind {
            MessageKind::Handshake => payload.to_vec(),
            MessageKind::Data => {
                let cipher = cipher.ok_or(TransportError::EncryptionRequired)?;
                cipher.encrypt(recipient, payload)?
            }
        };

        let fragments = split_into_fragments(
            fragment_id,
            original_type,
            recipient.as_str().as_bytes(),
            self.config.default_ttl,
            &wire_payload,
            mtu,
        );

        let queued = fragments.into_iter().map(|f| QueuedFragment {
            target: recipient.clone(),
            role,
            characteristic: characteristic.clone(),
            bytes: f.encode(),
        });

        match kind {
            MessageKind::Handshake => {
                for item in queued.rev() {
                    self.queue.push_front(item);
                }
            }
            MessageKind::Data => self.queue.extend(queued),
        }
        Ok(())
    }

    fn resolve_egress(
        &self,
        ledger: &LinkLedger,
        recipient: &PeerAddress,
    ) -> Result<(LinkRole, usize, String), TransportError> {
        if let Some(link) = ledger.client(recipient) {
            let characteristic = link
                .message_characteristic
                .clone()
                .unwrap_or_else(|| self.config.message_characteristic_uuid.clone());
            let mtu = if link.mtu > 0 { link.mtu } else { self.config.mtu_fallback };
            return Ok((LinkRole::Client, mtu, characteristic));
        }
        if let Some(link) = ledger.server(recipient) {
            let mtu = if link.mtu > 0 { link.mtu } else { self.config.mtu_fallback };
            return Ok((
                LinkRole::Server,
                mtu,
                self.config.message_characteristic_uuid.clone(),
            ));
        }
        Err(TransportError::NoUsableLink(recipient.clone()))
    }

    /// Decodes one inbound wire fragment and feeds it to the reassembly
    /// buffer, returning the completed message once all of its fragments
    /// have arrived.
    pub fn ingest_inbound(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<Option<ReassembledMessage>, FragmentDecodeError> {
        let fragment = Fragment::decode(bytes)?;
        Ok(self.reassembly.ingest(fragment, now_ms))
    }

    /// Feeds an already-decoded fragment to the reassembly buffer, for
    /// callers that had to inspect the fragment (its recipient) before
    /// deciding whether it is theirs to reassemble at all.
    pub fn ingest_fragment(&mut self, fragment: Fragment, now_ms: u64) -> Option<ReassembledMessage> {
        self.reassembly.ingest(fragment, now_ms)
    }

    /// True if there is outbound work in flight or still queued. Health
    /// checks are deferred rather than sent while this holds, so a ping
    /// never gets stuck behind, or jumps ahead of, in-flight message
    /// traffic.
    pub fn has_pending_work(&self) -> bool {
        self.processing.load(Ordering::SeqCst) || !self.queue.is_empty()
    }

    /// True if `message` is a duplicate delivery of one we have already
    /// processed (arrived via a different relay). Must be checked before
    /// [`Self::record_ingress`] for the same message.
    pub fn is_duplicate_message(&self, message: &ReassembledMessage, now_ms: u64) -> bool {
        self.loop_guard.already_seen(message.fragment_id, now_ms)
    }

    /// Records that `message` arrived from `ingress_addr`/`ingress_hint`.
    /// Call once per newly-processed message, after
    /// [`Self::is_duplicate_message`] has returned `false`.
    pub fn record_ingress(
        &mut self,
        message: &ReassembledMessage,
        ingress_addr: PeerAddress,
        ingress_hint: PeerHint,
        now_ms: u64,
    ) {
        self.loop_guard
            .record_ingress(message.fragment_id, ingress_hint, ingress_addr, now_ms);
    }

    /// True if a message at `ttl` should be forwarded toward `candidate`:
    /// the ttl has not been exhausted, and `candidate` is not the address
    /// the message just arrived from.
    pub fn should_forward_to(
        &self,
        ttl: u8,
        candidate: &PeerAddress,
        ingress_addr: &PeerAddress,
        ingress_hint: PeerHint,
    ) -> bool {
        if ttl == 0 {
            debug!(ttl, "dropping message with expired ttl");
            return false;
        }
        !self.loop_guard.is_bounce_back(candidate, ingress_addr, ingress_hint)
    }

    /// Admits one inbound fragment for relay, distinguishing a
    /// continuation fragment of an already-forwarded transmission from a
    /// duplicate delivery of the same fragment via another relay path.
    pub fn accept_for_relay(&mut self, fragment_id: [u8; 8], ingress_addr: &PeerAddress, now_ms: u64) -> bool {
        self.loop_guard.accept_for_relay(fragment_id, ingress_addr, now_ms)
    }

    /// Re-fragments a reassembled message toward `next_hop` at that
    /// link's own MTU, with the ttl decremented by one for this hop.
    /// Re-fragmentation exists because the next hop's MTU may differ
    /// from the one the message arrived over.
    pub fn enqueue_forward(
        &mut self,
        ledger: &LinkLedger,
        message: &ReassembledMessage,
        next_hop: &PeerAddress,
    ) -> Result<(), TransportError> {
        let Some(next_ttl) = message.ttl.checked_sub(1) else {
            return Ok(());
        };
        let (role, mtu, characteristic) = self.resolve_egress(ledger, next_hop)?;
        let fragments = split_into_fragments(
            message.fragment_id,
            message.original_type,
            &message.recipient,
            next_ttl,
            &message.payload,
            mtu,
        );
        self.queue.extend(fragments.into_iter().map(|f| QueuedFragment {
            target: next_hop.clone(),
            role,
            characteristic: characteristic.clone(),
            bytes: f.encode(),
        }));
        Ok(())
    }

    /// Forwards one inbound fragment toward `next_hop`. If the fragment
    /// already fits within the next hop's MTU it is forwarded raw, with
    /// its ttl decremented in place — no reassembly required. Only when
    /// the fragment is too large for the next hop (a shrinking-MTU relay
    /// hop) does this fall back to full reassembly and re-fragmentation
    /// via [`Self::enqueue_forward`].
    pub fn enqueue_forward_fragment(
        &mut self,
        ledger: &LinkLedger,
        fragment: Fragment,
        raw_bytes: &[u8],
        next_hop: &PeerAddress,
        now_ms: u64,
    ) -> Result<ForwardResult, TransportError> {
        let (role, mtu, characteristic) = self.resolve_egress(ledger, next_hop)?;
        if raw_bytes.len() <= mtu {
            let mut bytes = raw_bytes.to_vec();
            if Fragment::decrement_ttl_in_place(&mut bytes).is_none() {
                return Ok(ForwardResult::TtlExpired);
            }
            self.queue.push_back(QueuedFragment {
                target: next_hop.clone(),
                role,
                characteristic,
                bytes,
            });
            return Ok(ForwardResult::RawForwarded);
        }

        match self.reassembly.ingest(fragment, now_ms) {
            Some(message) => {
                self.enqueue_forward(ledger, &message, next_hop)?;
                Ok(ForwardResult::Reassembled)
            }
            None => Ok(ForwardResult::Buffered),
        }
    }

    /// Writes the next queued fragment to the driver, waiting out the
    /// configured inter-fragment pacing delay first. A no-op (not an
    /// error) if another pump is already in flight or the queue is
    /// empty, so callers can poll this unconditionally from an event
    /// loop without extra bookkeeping.
    pub async fn pump_once(&mut self, ledger: &LinkLedger) -> Result<bool, TransportError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.pump_once_inner(ledger).await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn pump_once_inner(&mut self, ledger: &LinkLedger) -> Result<bool, TransportError> {
        let Some(item) = self.queue.pop_front() else {
            return Ok(false);
        };

        let delay = if item.role == LinkRole::Client {
            self.config.inter_fragment_delay_central
        } else {
            self.config.inter_fragment_delay_forward
        };
        self.clock.sleep(delay).await;

        let write_result = match item.role {
            LinkRole::Client => {
                if !ledger.has_client(&item.target) {
                    return Err(TransportError::WriteFailedFatal(item.target));
                }
                self.driver
                    .write_characteristic(&item.target, &item.characteristic, &item.bytes, WriteType::WithoutResponse)
                    .await
            }
            LinkRole::Server => {
                if !ledger.has_server(&item.target) {
                    return Err(TransportError::WriteFailedFatal(item.target));
                }
                self.driver
                    .notify_characteristic(&item.target, &item.characteristic, &item.bytes)
                    .await
            }
        };

        let target = item.target.clone();
        match write_result {
            Ok(()) => Ok(true),
            Err(err) if err.is_transient() => {
                warn!(peer = %target, %err, "transient write failure, re-queuing fragment");
                self.queue.push_front(item);
                Err(TransportError::WriteFailedTransient(target))
            }
            Err(err) => {
                warn!(peer = %target, %err, "fatal write failure, dropping fragment");
                Err(TransportError::WriteFailedFatal(target))
            }
        }
    }

    pub fn evict_stale_reassemblies(&mut self, now_ms: u64) -> usize {
        let evicted = self.reassembly.evict_stale(now_ms);
        self.loop_guard.evict_stale(now_ms);
        evicted.len()
    }
}
